use crate::auth::challenge::{clear_challenge_holder, publish_challenge_holder};
use crate::auth::{
    parse_authentication_or_authorization_header, AuthScheme, ChallengeHolder, CredentialHandler,
    SharedChallengeHolder,
};
use crate::error::{ProxyConnectError, TransportError};
use bytes::Bytes;
use http::header::{HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderName, Method, Request, Response, StatusCode};
use log::{debug, warn};
use std::sync::Arc;

pub const PROXY_AUTHENTICATION_INFO: HeaderName =
    HeaderName::from_static("proxy-authentication-info");

const CNONCE: &str = "cnonce";
const NC: &str = "nc";

fn no_body() -> Bytes {
    Bytes::new()
}

/// One decoded piece of the proxy's answer to a CONNECT.
#[derive(Debug)]
pub enum ProxyResponsePart {
    Head(Response<()>),
    Content(Bytes),
    LastContent,
}

/// Per-attempt CONNECT state machine.
///
/// The first attempt against a proxy carries no credentials unless an earlier
/// digest exchange can be pipelined. A 407 publishes the proxy's challenges
/// into the shared holder so the next attempt answers them.
pub struct ProxyTunnelHandler {
    proxy_address: String,
    credentials: Option<Arc<dyn CredentialHandler>>,
    challenge_holder: SharedChallengeHolder,
    observed_holder: Option<Arc<ChallengeHolder>>,
    auth_scheme: AuthScheme,
    last_authorization: Option<String>,
    status: Option<StatusCode>,
}

impl ProxyTunnelHandler {
    pub fn new(
        proxy_address: impl Into<String>,
        credentials: Option<Arc<dyn CredentialHandler>>,
        challenge_holder: SharedChallengeHolder,
    ) -> Self {
        Self {
            proxy_address: proxy_address.into(),
            credentials,
            challenge_holder,
            observed_holder: None,
            auth_scheme: AuthScheme::None,
            last_authorization: None,
            status: None,
        }
    }

    pub fn proxy_address(&self) -> &str {
        &self.proxy_address
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        self.auth_scheme
    }

    /// The `Proxy-Authorization` value sent with the last CONNECT.
    pub fn last_authorization(&self) -> Option<&str> {
        self.last_authorization.as_deref()
    }

    /// The scheme an attempt would use given the published challenges.
    pub fn preferred_scheme(holder: Option<&ChallengeHolder>) -> AuthScheme {
        match holder {
            Some(h) if h.has_digest_challenge() => AuthScheme::Digest,
            Some(h) if h.has_basic_challenge() => AuthScheme::Basic,
            _ => AuthScheme::None,
        }
    }

    /// Builds `CONNECT host:port HTTP/1.1` for `target`.
    pub fn new_initial_message(&mut self, target: &str) -> Result<Request<()>, TransportError> {
        self.status = None;
        self.observed_holder = self.challenge_holder.load_full();

        let authorization = self.create_authorization();
        self.last_authorization = authorization.clone();

        let mut builder = Request::builder()
            .method(Method::CONNECT)
            .uri(target)
            .header(HOST, target);
        if let Some(value) = authorization {
            builder = builder.header(PROXY_AUTHORIZATION, value);
        }

        builder
            .body(())
            .map_err(|e| TransportError::Protocol(format!("Invalid CONNECT target '{}': {}", target, e)))
    }

    fn create_authorization(&mut self) -> Option<String> {
        let credentials = self.credentials.as_ref()?;

        let Some(holder) = self.observed_holder.as_deref() else {
            // An earlier digest exchange lets us answer before being challenged.
            let pipelined = credentials.attempt_to_pipeline_authorization(
                Method::CONNECT.as_str(),
                "/",
                &no_body,
            );
            self.auth_scheme = if pipelined.is_some() {
                AuthScheme::Digest
            } else {
                AuthScheme::None
            };
            return pipelined;
        };

        if holder.has_digest_challenge() {
            let digest = credentials.handle_digest(
                Method::CONNECT.as_str(),
                "/",
                holder.digest_challenges(),
                &no_body,
            );
            if digest.is_some() {
                self.auth_scheme = AuthScheme::Digest;
                return digest;
            }
        }

        if holder.has_basic_challenge() {
            self.auth_scheme = AuthScheme::Basic;
            return Some(credentials.handle_basic());
        }

        self.auth_scheme = AuthScheme::None;
        None
    }

    /// Feeds one piece of the proxy's response.
    ///
    /// Returns `Ok(true)` once the tunnel is established. Everything before the
    /// final content marker returns `Ok(false)`.
    pub fn handle_response(&mut self, part: ProxyResponsePart) -> Result<bool, TransportError> {
        match part {
            ProxyResponsePart::Head(response) => {
                if self.status.is_some() {
                    return Err(TransportError::Protocol(
                        "Received too many responses for a CONNECT request".to_string(),
                    ));
                }

                let status = response.status();
                self.status = Some(status);
                debug!("Proxy {} answered CONNECT with {}", self.proxy_address, status);

                if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
                    self.publish_challenges(&response);
                } else if status == StatusCode::OK {
                    self.process_authentication_info(&response)?;
                }
                Ok(false)
            }
            ProxyResponsePart::Content(_) => Ok(false),
            ProxyResponsePart::LastContent => match self.status {
                None => Err(ProxyConnectError::new(
                    "Never received response for CONNECT request",
                    self.auth_scheme,
                )
                .into()),
                Some(status) if status != StatusCode::OK => Err(ProxyConnectError::new(
                    format!("Failed to connect to proxy. Status: {}", status),
                    self.auth_scheme,
                )
                .with_status(status)
                .into()),
                Some(_) => {
                    self.release_digest_challenge();
                    Ok(true)
                }
            },
        }
    }

    // Later attempts pipeline from the credential handler's digest context.
    fn release_digest_challenge(&self) {
        if self.auth_scheme == AuthScheme::Digest && self.observed_holder.is_some() {
            clear_challenge_holder(&self.challenge_holder, &self.observed_holder);
        }
    }

    fn publish_challenges(&self, response: &Response<()>) {
        let values = response
            .headers()
            .get_all(PROXY_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok());
        let holder = ChallengeHolder::from_headers(values);

        if holder.is_empty() {
            warn!("Proxy {} sent 407 without a usable challenge", self.proxy_address);
        }
        if !publish_challenge_holder(&self.challenge_holder, &self.observed_holder, holder) {
            debug!("A newer challenge for {} was already published", self.proxy_address);
        }
    }

    fn process_authentication_info(&self, response: &Response<()>) -> Result<(), TransportError> {
        let Some(info) = response.headers().get(PROXY_AUTHENTICATION_INFO) else {
            return Ok(());
        };
        let info = info.to_str().map_err(|_| {
            TransportError::Protocol("Proxy-Authentication-Info is not valid ASCII".to_string())
        })?;

        let info_pieces = parse_authentication_or_authorization_header(info);
        let sent_pieces = self
            .last_authorization
            .as_deref()
            .map(parse_authentication_or_authorization_header)
            .unwrap_or_default();

        validate_authentication_info(CNONCE, info_pieces.get(CNONCE), sent_pieces.get(CNONCE))?;
        validate_authentication_info(NC, info_pieces.get(NC), sent_pieces.get(NC))?;

        if let Some(credentials) = &self.credentials {
            credentials.consume_authentication_info(&info_pieces);
        }
        Ok(())
    }
}

fn validate_authentication_info(
    name: &str,
    received: Option<&String>,
    sent: Option<&String>,
) -> Result<(), TransportError> {
    match received {
        Some(received) if !sent.is_some_and(|sent| sent.eq_ignore_ascii_case(received)) => {
            Err(TransportError::IllegalState(format!(
                "Property received in Proxy-Authentication-Info doesn't match the value sent in \
                 Proxy-Authorization: {}",
                name
            )))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthorizationChallengeHandler;

    fn response(status: StatusCode, headers: &[(&str, &str)]) -> ProxyResponsePart {
        let mut builder = Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        ProxyResponsePart::Head(builder.body(()).unwrap())
    }

    fn handler_with_credentials() -> ProxyTunnelHandler {
        let credentials: Arc<dyn CredentialHandler> =
            Arc::new(AuthorizationChallengeHandler::new("user", "pass"));
        ProxyTunnelHandler::new("proxy:3128", Some(credentials), ChallengeHolder::new_shared())
    }

    #[test]
    fn test_first_attempt_is_unauthenticated() {
        let mut handler = handler_with_credentials();
        let request = handler.new_initial_message("example.com:443").unwrap();

        assert_eq!(request.method(), Method::CONNECT);
        assert_eq!(request.uri().to_string(), "example.com:443");
        assert!(request.headers().get(PROXY_AUTHORIZATION).is_none());
        assert_eq!(handler.auth_scheme(), AuthScheme::None);
    }

    #[test]
    fn test_basic_only_holder_yields_basic() {
        let mut handler = handler_with_credentials();
        handler.challenge_holder.store(Some(Arc::new(ChallengeHolder::new(true, vec![]))));

        let request = handler.new_initial_message("example.com:443").unwrap();
        let value = request.headers()[PROXY_AUTHORIZATION].to_str().unwrap();

        assert_eq!(value, "Basic dXNlcjpwYXNz");
        assert_eq!(handler.auth_scheme(), AuthScheme::Basic);
    }

    #[test]
    fn test_digest_preferred_over_basic() {
        let mut handler = handler_with_credentials();
        let holder = ChallengeHolder::from_headers([
            "Basic realm=\"p\"",
            "Digest realm=\"p\", nonce=\"abc\", qop=\"auth\"",
        ]);
        handler.challenge_holder.store(Some(Arc::new(holder)));

        let request = handler.new_initial_message("example.com:443").unwrap();
        let value = request.headers()[PROXY_AUTHORIZATION].to_str().unwrap();

        assert!(value.starts_with("Digest "));
        assert_eq!(handler.auth_scheme(), AuthScheme::Digest);
        assert_eq!(handler.last_authorization(), Some(value));
    }

    #[test]
    fn test_407_publishes_challenges() {
        let mut handler = handler_with_credentials();
        handler.new_initial_message("example.com:443").unwrap();

        let head = response(
            StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            &[("Proxy-Authenticate", "Basic realm=\"p\"")],
        );
        assert!(!handler.handle_response(head).unwrap());

        let published = handler.challenge_holder.load_full().unwrap();
        assert!(published.has_basic_challenge());

        let err = handler.handle_response(ProxyResponsePart::LastContent).unwrap_err();
        match err {
            TransportError::ProxyConnect(e) => {
                assert_eq!(e.status(), Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_second_head_is_protocol_violation() {
        let mut handler = handler_with_credentials();
        handler.new_initial_message("example.com:443").unwrap();

        handler.handle_response(response(StatusCode::OK, &[])).unwrap();
        let err = handler.handle_response(response(StatusCode::OK, &[])).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn test_content_without_head_fails() {
        let mut handler = handler_with_credentials();
        handler.new_initial_message("example.com:443").unwrap();

        assert!(!handler.handle_response(ProxyResponsePart::Content(Bytes::from_static(b"x"))).unwrap());
        let err = handler.handle_response(ProxyResponsePart::LastContent).unwrap_err();
        assert!(matches!(err, TransportError::ProxyConnect(_)));
    }

    #[test]
    fn test_cnonce_mismatch_is_illegal_state() {
        let mut handler = handler_with_credentials();
        handler.challenge_holder.store(Some(Arc::new(ChallengeHolder::from_headers([
            "Digest realm=\"p\", nonce=\"abc\", qop=\"auth\"",
        ]))));
        handler.new_initial_message("example.com:443").unwrap();

        let head = response(
            StatusCode::OK,
            &[("Proxy-Authentication-Info", "cnonce=\"not-what-was-sent\", nc=00000001")],
        );
        let err = handler.handle_response(head).unwrap_err();
        assert!(matches!(err, TransportError::IllegalState(_)));
    }

    #[test]
    fn test_matching_authentication_info_succeeds() {
        let mut handler = handler_with_credentials();
        handler.challenge_holder.store(Some(Arc::new(ChallengeHolder::from_headers([
            "Digest realm=\"p\", nonce=\"abc\", qop=\"auth\"",
        ]))));
        handler.new_initial_message("example.com:443").unwrap();

        let sent = parse_authentication_or_authorization_header(handler.last_authorization().unwrap());
        let info = format!("cnonce=\"{}\", nc={}, nextnonce=\"next\"", sent["cnonce"], sent["nc"]);
        let head = response(StatusCode::OK, &[("Proxy-Authentication-Info", info.as_str())]);

        assert!(!handler.handle_response(head).unwrap());
        assert!(handler.handle_response(ProxyResponsePart::LastContent).unwrap());
        assert!(handler.challenge_holder.load().is_none());
    }
}
