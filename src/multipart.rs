//! Streamed `multipart/form-data` bodies.
//!
//! Files are encoded by a producer task started when the request is sent.
//! The task writes into a bounded channel that the transport drains as the
//! request body, so large files never sit in memory. A failing producer
//! records its error in a shared slot before aborting the channel, and the
//! client reports that recorded error instead of the transport error the
//! aborted upload caused.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use rand::RngExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ReqResult;
use crate::body::{ChannelBody, ReqBody};
use crate::cancel::Cancellation;
use crate::error::Error;
use crate::util::lock_unpoisoned;
use crate::values::{Form, IntoValues};

const DEFAULT_FILE_NAME: &str = "file";
const SNIFF_LEN: usize = 512;
const CHUNK_SIZE: usize = 8 * 1024;
const CHANNEL_CAPACITY: usize = 8;

enum PartSource {
    Path(PathBuf),
    Bytes(Bytes),
    Reader(Box<dyn AsyncRead + Send + Sync + Unpin>),
}

/// One file of a multipart body.
pub struct Part {
    source: PartSource,
    file_name: Option<String>,
    mime: Option<String>,
}

impl Part {
    /// Reads the file at `path` when the request is sent. The file name
    /// defaults to the last path component.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Self {
            source: PartSource::Path(path),
            file_name,
            mime: None,
        }
    }

    pub fn bytes(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            source: PartSource::Bytes(data.into()),
            file_name: Some(file_name.into()),
            mime: None,
        }
    }

    pub fn reader(
        file_name: impl Into<String>,
        reader: impl AsyncRead + Send + Sync + Unpin + 'static,
    ) -> Self {
        Self {
            source: PartSource::Reader(Box::new(reader)),
            file_name: Some(file_name.into()),
            mime: None,
        }
    }

    pub fn file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Explicit content type; otherwise it is sniffed from the first bytes.
    pub fn mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    fn resolved_file_name(&self) -> &str {
        match self.file_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_FILE_NAME,
        }
    }
}

impl std::fmt::Debug for Part {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            PartSource::Path(path) => format!("path({})", path.display()),
            PartSource::Bytes(bytes) => format!("bytes({})", bytes.len()),
            PartSource::Reader(_) => "reader".to_owned(),
        };
        formatter
            .debug_struct("Part")
            .field("source", &source)
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .finish()
    }
}

/// A `multipart/form-data` payload: files first, then plain form fields.
#[derive(Debug)]
pub struct Multipart {
    boundary: String,
    files: Vec<(String, Part)>,
    fields: Form,
}

impl Default for Multipart {
    fn default() -> Self {
        Self::new()
    }
}

impl Multipart {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        Self {
            boundary: format!("{:032x}", rng.random::<u128>()),
            files: Vec::new(),
            fields: Form::new(),
        }
    }

    /// Adds a file under `field`. A field may carry at most one file.
    pub fn file(mut self, field: impl Into<String>, part: Part) -> ReqResult<Self> {
        let field = field.into();
        if self.files.iter().any(|(existing, _)| *existing == field) {
            return Err(Error::MultipartDuplicateField { field });
        }
        self.files.push((field, part));
        Ok(self)
    }

    pub fn text(mut self, name: impl Into<String>, value: impl IntoValues) -> Self {
        self.fields.add(name, value);
        self
    }

    pub fn fields(mut self, fields: &Form) -> Self {
        self.fields.update(fields);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Spawns the producer and returns the body the transport reads from.
    pub(crate) fn start(self, cancellation: Cancellation) -> MultipartUpload {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let failure = Arc::new(Mutex::new(None));
        let task = tokio::spawn(produce(self, sender, Arc::clone(&failure), cancellation));
        MultipartUpload {
            body: Some(ChannelBody::new(receiver).boxed()),
            failure,
            task,
        }
    }
}

/// Handle on a running producer. Dropping it stops the producer.
pub(crate) struct MultipartUpload {
    body: Option<ReqBody>,
    failure: Arc<Mutex<Option<Error>>>,
    task: JoinHandle<()>,
}

impl MultipartUpload {
    pub(crate) fn take_body(&mut self) -> Option<ReqBody> {
        self.body.take()
    }

    /// The producer's error, if it failed.
    pub(crate) fn take_failure(&self) -> Option<Error> {
        lock_unpoisoned(&self.failure).take()
    }
}

impl Drop for MultipartUpload {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum ProduceError {
    /// The consumer hung up; nothing to report.
    Closed,
    Io {
        field: String,
        file_name: String,
        source: std::io::Error,
    },
}

async fn produce(
    multipart: Multipart,
    sender: mpsc::Sender<Result<Bytes, std::io::Error>>,
    failure: Arc<Mutex<Option<Error>>>,
    cancellation: Cancellation,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancellation.fired() => {
            let _ = sender
                .send(Err(std::io::Error::other("multipart upload cancelled")))
                .await;
            return;
        }
        outcome = write_multipart(multipart, &sender) => outcome,
    };

    match outcome {
        Ok(()) | Err(ProduceError::Closed) => {}
        Err(ProduceError::Io {
            field,
            file_name,
            source,
        }) => {
            debug!(field = %field, file_name = %file_name, error = %source, "multipart producer failed");
            let message = format!("multipart producer failed on {field}=@{file_name}: {source}");
            *lock_unpoisoned(&failure) = Some(Error::MultipartProducer {
                field,
                file_name,
                source,
            });
            let _ = sender.send(Err(std::io::Error::other(message))).await;
        }
    }
}

async fn write_multipart(
    multipart: Multipart,
    sender: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), ProduceError> {
    let Multipart {
        boundary,
        files,
        fields,
    } = multipart;

    for (field, part) in files {
        write_file_part(&boundary, field, part, sender).await?;
    }

    for (name, value) in fields.pairs() {
        let mut section = BytesMut::new();
        section.put_slice(format!("--{boundary}\r\n").as_bytes());
        section.put_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape_quotes(name)
            )
            .as_bytes(),
        );
        section.put_slice(value.as_bytes());
        section.put_slice(b"\r\n");
        emit(sender, section.freeze()).await?;
    }

    emit(sender, Bytes::from(format!("--{boundary}--\r\n"))).await
}

async fn write_file_part(
    boundary: &str,
    field: String,
    part: Part,
    sender: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), ProduceError> {
    let file_name = part.resolved_file_name().to_owned();
    let io_error = |source: std::io::Error| ProduceError::Io {
        field: field.clone(),
        file_name: file_name.clone(),
        source,
    };

    let mut reader: Box<dyn AsyncRead + Send + Unpin> = match part.source {
        PartSource::Path(path) => Box::new(tokio::fs::File::open(&path).await.map_err(io_error)?),
        PartSource::Bytes(bytes) => Box::new(std::io::Cursor::new(bytes)),
        PartSource::Reader(reader) => reader,
    };

    let head = read_up_to(&mut reader, SNIFF_LEN).await.map_err(io_error)?;
    let mime = part
        .mime
        .unwrap_or_else(|| sniff_content_type(&head).to_owned());

    let mut section = BytesMut::new();
    section.put_slice(format!("--{boundary}\r\n").as_bytes());
    section.put_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            escape_quotes(&field),
            escape_quotes(&file_name)
        )
        .as_bytes(),
    );
    section.put_slice(format!("Content-Type: {mime}\r\n\r\n").as_bytes());
    section.put_slice(&head);
    emit(sender, section.freeze()).await?;

    loop {
        let mut chunk = BytesMut::zeroed(CHUNK_SIZE);
        let read = reader.read(&mut chunk).await.map_err(io_error)?;
        if read == 0 {
            break;
        }
        chunk.truncate(read);
        emit(sender, chunk.freeze()).await?;
    }

    emit(sender, Bytes::from_static(b"\r\n")).await
}

async fn read_up_to<R: AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> std::io::Result<Vec<u8>> {
    let mut head = vec![0_u8; limit];
    let mut filled = 0;
    while filled < limit {
        let read = reader.read(&mut head[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    head.truncate(filled);
    Ok(head)
}

async fn emit(
    sender: &mpsc::Sender<Result<Bytes, std::io::Error>>,
    chunk: Bytes,
) -> Result<(), ProduceError> {
    sender
        .send(Ok(chunk))
        .await
        .map_err(|_| ProduceError::Closed)
}

fn escape_quotes(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Content type guessed from leading bytes; `application/octet-stream` when
/// nothing matches.
pub(crate) fn sniff_content_type(head: &[u8]) -> &'static str {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b\x08", "application/x-gzip"),
        (b"ID3", "audio/mpeg"),
        (b"fLaC", "audio/flac"),
        (b"OggS", "application/ogg"),
        (b"\x00\x00\x01\x00", "image/x-icon"),
        (b"BM", "image/bmp"),
    ];

    if head.len() >= 12 && &head[..4] == b"RIFF" {
        match &head[8..12] {
            b"WEBP" => return "image/webp",
            b"WAVE" => return "audio/wave",
            _ => {}
        }
    }
    if head.len() >= 8 && &head[4..8] == b"ftyp" {
        return "video/mp4";
    }
    for (signature, mime) in SIGNATURES {
        if head.starts_with(signature) {
            return mime;
        }
    }

    let trimmed = head
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .map(|start| &head[start..])
        .unwrap_or_default();
    let lowered = String::from_utf8_lossy(&trimmed[..trimmed.len().min(16)]).to_ascii_lowercase();
    if lowered.starts_with("<!doctype html") || lowered.starts_with("<html") {
        return "text/html; charset=utf-8";
    }
    if lowered.starts_with("<?xml") {
        return "text/xml; charset=utf-8";
    }
    if head.is_empty() {
        return "text/plain; charset=utf-8";
    }
    let binary = head
        .iter()
        .any(|byte| matches!(byte, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f));
    if !binary && std::str::from_utf8(head).is_ok() {
        return "text/plain; charset=utf-8";
    }
    "application/octet-stream"
}
