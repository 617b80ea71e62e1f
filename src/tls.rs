use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

use crate::ReqResult;
use crate::error::Error;

/// TLS material collected by the client builder. Applied once, when the
/// transport is built.
#[derive(Clone, Debug, Default)]
pub(crate) struct TlsOptions {
    pub(crate) root_certificates_pem: Vec<Vec<u8>>,
    pub(crate) client_identity_pem: Option<(Vec<u8>, Vec<u8>)>,
    pub(crate) accept_invalid_certs: bool,
}

impl TlsOptions {
    pub(crate) fn is_customized(&self) -> bool {
        !self.root_certificates_pem.is_empty()
            || self.client_identity_pem.is_some()
            || self.accept_invalid_certs
    }
}

fn tls_config_error(message: impl Into<String>) -> Error {
    Error::TlsConfig {
        message: message.into(),
    }
}

fn parse_pem_certificates(pem: &[u8], what: &str) -> ReqResult<Vec<CertificateDer<'static>>> {
    let mut certificates = Vec::new();
    for item in CertificateDer::pem_slice_iter(pem) {
        certificates.push(
            item.map_err(|source| tls_config_error(format!("failed to parse {what} PEM: {source}")))?,
        );
    }
    if certificates.is_empty() {
        return Err(tls_config_error(format!("no certificate blocks found in {what} PEM")));
    }
    Ok(certificates)
}

/// Web PKI roots plus any extra roots the caller trusts.
fn build_root_store(options: &TlsOptions) -> ReqResult<RootCertStore> {
    let mut root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for pem in &options.root_certificates_pem {
        let parsed = parse_pem_certificates(pem, "root certificate")?;
        let (added, ignored) = root_store.add_parsable_certificates(parsed);
        if added == 0 {
            return Err(tls_config_error("failed to parse PEM root certificate(s)"));
        }
        if ignored > 0 {
            warn!(ignored, "some PEM root certificates were ignored");
        }
    }
    Ok(root_store)
}

pub(crate) fn build_tls_config(options: &TlsOptions) -> ReqResult<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let root_store = build_root_store(options)?;

    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsBackendInit {
            message: source.to_string(),
        })?
        .with_root_certificates(root_store);

    let mut config = match &options.client_identity_pem {
        None => builder.with_no_client_auth(),
        Some((cert_chain_pem, private_key_pem)) => {
            let cert_chain = parse_pem_certificates(cert_chain_pem, "client certificate chain")?;
            let private_key = PrivateKeyDer::from_pem_slice(private_key_pem).map_err(|source| {
                tls_config_error(format!("failed to parse client private key PEM: {source}"))
            })?;
            builder
                .with_client_auth_cert(cert_chain, private_key)
                .map_err(|source| {
                    tls_config_error(format!("failed to configure client identity: {source}"))
                })?
        }
    };

    if options.accept_invalid_certs {
        warn!("tls certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }));
    }
    Ok(config)
}

/// Skips chain and hostname checks but still verifies handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
