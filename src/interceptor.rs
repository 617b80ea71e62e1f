use crate::ReqResult;
use crate::request::Request;
use crate::response::Response;

/// A hook around every exchange of a client.
///
/// Before-request hooks run in registration order and the first error aborts
/// the send before anything reaches the network. After-response hooks run in
/// registration order once the final response is known; the first error is
/// stored on the response and the remaining hooks are skipped.
pub trait Interceptor: Send + Sync {
    fn before_request(&self, _request: &mut Request) -> ReqResult<()> {
        Ok(())
    }

    fn after_response(&self, _response: &mut Response) -> ReqResult<()> {
        Ok(())
    }
}

pub struct BeforeRequest<F>(pub F);

impl<F> Interceptor for BeforeRequest<F>
where
    F: Fn(&mut Request) -> ReqResult<()> + Send + Sync,
{
    fn before_request(&self, request: &mut Request) -> ReqResult<()> {
        (self.0)(request)
    }
}

pub struct AfterResponse<F>(pub F);

impl<F> Interceptor for AfterResponse<F>
where
    F: Fn(&mut Response) -> ReqResult<()> + Send + Sync,
{
    fn after_response(&self, response: &mut Response) -> ReqResult<()> {
        (self.0)(response)
    }
}

/// Client-wide defaults. Each one fills in a value only when the request did
/// not set it.
pub mod hooks {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use http::HeaderMap;
    use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue, REFERER, USER_AGENT};

    use super::{AfterResponse, BeforeRequest, Interceptor};
    use crate::ReqResult;
    use crate::request::Request;
    use crate::response::Response;
    use crate::util::{header_map_from_values, merge_missing_headers, parse_header_value};
    use crate::values::{Cookies, Form, Headers, Params};

    fn default_header(name: HeaderName, value: &str) -> ReqResult<impl Interceptor + use<>> {
        let value = parse_header_value(name.as_str(), value)?;
        Ok(BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            if !request.headers_ref().contains_key(&name) {
                request.headers_mut().insert(name.clone(), value.clone());
            }
            Ok(())
        }))
    }

    fn sensitive_default_header(
        name: HeaderName,
        value: &str,
    ) -> ReqResult<impl Interceptor + use<>> {
        let mut value: HeaderValue = parse_header_value(name.as_str(), value)?;
        value.set_sensitive(true);
        Ok(BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            if !request.headers_ref().contains_key(&name) {
                request.headers_mut().insert(name.clone(), value.clone());
            }
            Ok(())
        }))
    }

    pub fn default_host(host: &str) -> impl Interceptor + use<> {
        let host = host.to_owned();
        BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            if request.host_override().is_none() {
                request.set_host(host.clone());
            }
            Ok(())
        })
    }

    pub fn default_headers(headers: Headers) -> ReqResult<impl Interceptor> {
        let defaults: HeaderMap = header_map_from_values(&headers)?;
        Ok(BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            merge_missing_headers(request.headers_mut(), &defaults);
            Ok(())
        }))
    }

    /// Skipped when the request sets a content type or its body implies one.
    pub fn default_content_type(content_type: &str) -> ReqResult<impl Interceptor + use<>> {
        let value = parse_header_value(CONTENT_TYPE.as_str(), content_type)?;
        Ok(BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            if !request.headers_ref().contains_key(CONTENT_TYPE)
                && request.body_content_type().is_none()
            {
                request.headers_mut().insert(CONTENT_TYPE, value.clone());
            }
            Ok(())
        }))
    }

    pub fn default_user_agent(user_agent: &str) -> ReqResult<impl Interceptor + use<>> {
        default_header(USER_AGENT, user_agent)
    }

    pub fn default_referer(referer: &str) -> ReqResult<impl Interceptor + use<>> {
        default_header(REFERER, referer)
    }

    pub fn default_query(params: Params) -> impl Interceptor {
        BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            request.query_params_mut().merge(&params);
            Ok(())
        })
    }

    pub fn default_form(form: Form) -> impl Interceptor {
        BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            request.form_mut().merge(&form);
            Ok(())
        })
    }

    pub fn default_cookies(cookies: Cookies) -> impl Interceptor {
        BeforeRequest(move |request: &mut Request| -> ReqResult<()> {
            request.cookies_mut().merge(&cookies);
            Ok(())
        })
    }

    pub fn default_basic_auth(
        username: &str,
        password: &str,
    ) -> ReqResult<impl Interceptor + use<>> {
        let token = BASE64_STANDARD.encode(format!("{username}:{password}"));
        sensitive_default_header(AUTHORIZATION, &format!("Basic {token}"))
    }

    pub fn default_bearer_token(token: &str) -> ReqResult<impl Interceptor + use<>> {
        sensitive_default_header(AUTHORIZATION, &format!("Bearer {token}"))
    }

    /// Flags every non-2xx response.
    pub fn ensure_status_2xx() -> impl Interceptor {
        AfterResponse(|response: &mut Response| response.check_status_2xx())
    }
}

#[cfg(test)]
mod tests {
    use http::header::{AUTHORIZATION, CONTENT_TYPE, REFERER, USER_AGENT};

    use super::Interceptor;
    use super::hooks::{
        default_basic_auth, default_bearer_token, default_content_type, default_cookies,
        default_form, default_headers, default_host, default_query, default_referer,
        default_user_agent,
    };
    use crate::client::Client;
    use crate::request::Request;
    use crate::values::{Cookies, Form, Headers, Params};

    fn request() -> Request {
        Request::post("http://example.com/")
            .expect("valid url")
            .user_agent("request-agent")
            .expect("user agent")
    }

    #[test]
    fn header_defaults_never_override_request_values() {
        let mut request = request();
        default_user_agent("default-agent")
            .expect("hook")
            .before_request(&mut request)
            .expect("run hook");
        default_referer("https://ref.example/")
            .expect("hook")
            .before_request(&mut request)
            .expect("run hook");
        default_headers(Headers::from([("x-team", "core"), ("user-agent", "other")]))
            .expect("hook")
            .before_request(&mut request)
            .expect("run hook");

        let headers = request.headers_ref();
        assert_eq!(headers[USER_AGENT], "request-agent");
        assert_eq!(headers[REFERER], "https://ref.example/");
        assert_eq!(headers["x-team"], "core");
    }

    #[test]
    fn default_content_type_yields_to_body_type() {
        let hook = default_content_type("application/octet-stream").expect("hook");

        let mut raw = request().body("bytes");
        hook.before_request(&mut raw).expect("run hook");
        assert_eq!(raw.headers_ref()[CONTENT_TYPE], "application/octet-stream");

        let mut text = request().text("words");
        hook.before_request(&mut text).expect("run hook");
        assert!(!text.headers_ref().contains_key(CONTENT_TYPE));
    }

    #[test]
    fn value_defaults_merge_under_request_values() {
        let mut request = request()
            .query(Params::from([("page", "2")]))
            .form(Form::from([("name", "req")]))
            .cookies(Cookies::from([("sid", "req")]));

        default_query(Params::from([("page", "1"), ("lang", "en")]))
            .before_request(&mut request)
            .expect("run hook");
        default_form(Form::from([("name", "default"), ("extra", "1")]))
            .before_request(&mut request)
            .expect("run hook");
        default_cookies(Cookies::from([("sid", "default"), ("theme", "dark")]))
            .before_request(&mut request)
            .expect("run hook");
        default_host("default.example")
            .before_request(&mut request)
            .expect("run hook");

        assert_eq!(request.query_params().get("page"), Some("2"));
        assert_eq!(request.query_params().get("lang"), Some("en"));
        assert_eq!(request.form_values().get("name"), Some("req"));
        assert_eq!(request.form_values().get("extra"), Some("1"));
        assert_eq!(request.cookie_values().get("sid"), Some("req"));
        assert_eq!(request.cookie_values().get("theme"), Some("dark"));
        assert_eq!(request.host_override(), Some("default.example"));
    }

    #[test]
    fn hooks_from_borrowed_config_outlive_the_source() {
        let agent = String::from("configured-agent/2.0");
        let host = String::from("configured.example");
        let secret = String::from("from-config");
        let user_agent = default_user_agent(&agent).expect("hook");
        let host_hook = default_host(&host);
        let basic = default_basic_auth("user", &secret).expect("hook");
        drop((agent, host, secret));

        let _builder = Client::builder()
            .interceptor(user_agent)
            .interceptor(host_hook)
            .interceptor(basic);
    }

    #[test]
    fn bearer_default_is_sensitive() {
        let mut request = request();
        default_bearer_token("abc")
            .expect("hook")
            .before_request(&mut request)
            .expect("run hook");
        let value = &request.headers_ref()[AUTHORIZATION];
        assert_eq!(value, "Bearer abc");
        assert!(value.is_sensitive());
    }
}
