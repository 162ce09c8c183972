use super::challenge::DigestChallenge;
use super::{BASIC, DIGEST};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use md5::Md5;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::sync::{Mutex, OnceLock};
use zeroize::Zeroizing;

/// Produces `Proxy-Authorization` values for the challenges a proxy sends.
///
/// `entity_body` supplies the request body for `qop=auth-int`; it is only
/// called when that protection level is selected.
pub trait CredentialHandler: Send + Sync {
    fn handle_basic(&self) -> String;

    fn handle_digest(
        &self,
        method: &str,
        uri: &str,
        challenges: &[DigestChallenge],
        entity_body: &dyn Fn() -> Bytes,
    ) -> Option<String>;

    /// Authorizes a request from the last digest challenge without waiting
    /// for a new 407. Returns `None` when there is no digest context yet.
    fn attempt_to_pipeline_authorization(
        &self,
        method: &str,
        uri: &str,
        entity_body: &dyn Fn() -> Bytes,
    ) -> Option<String>;

    /// Applies a `Proxy-Authentication-Info` (e.g. `nextnonce` rotation).
    fn consume_authentication_info(&self, _info: &HashMap<String, String>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DigestAlgorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    fn from_challenge(challenge: &DigestChallenge) -> Option<Self> {
        let Some(name) = challenge.get("algorithm") else {
            return Some(DigestAlgorithm::Md5);
        };
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "MD5-SESS" => Some(DigestAlgorithm::Md5Sess),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Some(DigestAlgorithm::Sha256Sess),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn preference(&self) -> u8 {
        match self {
            DigestAlgorithm::Sha256Sess => 4,
            DigestAlgorithm::Sha256 => 3,
            DigestAlgorithm::Md5Sess => 2,
            DigestAlgorithm::Md5 => 1,
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => hex(&Md5::digest(data)),
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => hex(&Sha256::digest(data)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qop {
    /// RFC 2069 style, no qop offered.
    Legacy,
    Auth,
    AuthInt,
}

impl Qop {
    fn from_challenge(challenge: &DigestChallenge) -> Option<Self> {
        let Some(offered) = challenge.get("qop") else {
            return Some(Qop::Legacy);
        };
        let offered: Vec<&str> = offered.split(',').map(str::trim).collect();
        if offered.iter().any(|q| q.eq_ignore_ascii_case("auth")) {
            Some(Qop::Auth)
        } else if offered.iter().any(|q| q.eq_ignore_ascii_case("auth-int")) {
            Some(Qop::AuthInt)
        } else {
            None
        }
    }

    fn preference(&self) -> u8 {
        match self {
            Qop::Auth => 3,
            Qop::AuthInt => 2,
            Qop::Legacy => 1,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Qop::Legacy => "",
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

#[derive(Default)]
struct DigestState {
    last_challenge: Option<DigestChallenge>,
    nonce_counts: HashMap<String, u32>,
}

/// Basic and Digest credentials for one proxy user.
pub struct AuthorizationChallengeHandler {
    username: String,
    password: Zeroizing<String>,
    basic: OnceLock<String>,
    digest: Mutex<DigestState>,
}

impl fmt::Debug for AuthorizationChallengeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationChallengeHandler")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl AuthorizationChallengeHandler {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
            basic: OnceLock::new(),
            digest: Mutex::new(DigestState::default()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn authorize(
        &self,
        state: &mut DigestState,
        method: &str,
        uri: &str,
        challenge: &DigestChallenge,
        entity_body: &dyn Fn() -> Bytes,
    ) -> Option<String> {
        let algorithm = DigestAlgorithm::from_challenge(challenge)?;
        let qop = Qop::from_challenge(challenge)?;
        let realm = challenge.get("realm")?;
        let nonce = challenge.get("nonce")?;

        let mut cnonce_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut cnonce_bytes);
        let cnonce = hex(&cnonce_bytes);

        let count = state.nonce_counts.entry(nonce.clone()).or_insert(0);
        *count += 1;
        let nc = format!("{:08x}", *count);

        let credentials = Zeroizing::new(format!("{}:{}:{}", self.username, realm, *self.password));
        let mut ha1 = algorithm.hash(credentials.as_bytes());
        if algorithm.is_session() {
            ha1 = algorithm.hash(format!("{}:{}:{}", ha1, nonce, cnonce).as_bytes());
        }

        let ha2 = match qop {
            Qop::AuthInt => {
                let body_hash = algorithm.hash(&entity_body());
                algorithm.hash(format!("{}:{}:{}", method, uri, body_hash).as_bytes())
            }
            Qop::Auth | Qop::Legacy => algorithm.hash(format!("{}:{}", method, uri).as_bytes()),
        };

        let response = match qop {
            Qop::Legacy => algorithm.hash(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()),
            _ => algorithm.hash(
                format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop.as_str(), ha2).as_bytes(),
            ),
        };

        let mut header = format!(
            "{} username={}, realm={}, nonce={}, uri={}, response=\"{}\", algorithm={}",
            DIGEST,
            quote(&self.username),
            quote(realm),
            quote(nonce),
            quote(uri),
            response,
            algorithm.name(),
        );
        if qop != Qop::Legacy {
            let _ = write!(header, ", qop={}, nc={}, cnonce=\"{}\"", qop.as_str(), nc, cnonce);
        }
        if let Some(opaque) = challenge.get("opaque") {
            let _ = write!(header, ", opaque={}", quote(opaque));
        }

        state.last_challenge = Some(challenge.clone());
        Some(header)
    }
}

impl CredentialHandler for AuthorizationChallengeHandler {
    fn handle_basic(&self) -> String {
        self.basic
            .get_or_init(|| {
                let credentials = Zeroizing::new(format!("{}:{}", self.username, *self.password));
                format!("{} {}", BASIC, general_purpose::STANDARD.encode(credentials.as_bytes()))
            })
            .clone()
    }

    fn handle_digest(
        &self,
        method: &str,
        uri: &str,
        challenges: &[DigestChallenge],
        entity_body: &dyn Fn() -> Bytes,
    ) -> Option<String> {
        // Strongest algorithm first, then qop; the earliest challenge wins a tie.
        let challenge = challenges
            .iter()
            .rev()
            .filter(|c| c.contains_key("realm") && c.contains_key("nonce"))
            .filter_map(|c| {
                let algorithm = DigestAlgorithm::from_challenge(c)?;
                let qop = Qop::from_challenge(c)?;
                Some(((algorithm.preference(), qop.preference()), c))
            })
            .max_by_key(|(preference, _)| *preference)
            .map(|(_, c)| c);

        let Some(challenge) = challenge else {
            warn!("None of the {} digest challenge(s) can be answered", challenges.len());
            return None;
        };

        let mut state = self.digest.lock().ok()?;
        self.authorize(&mut state, method, uri, challenge, entity_body)
    }

    fn attempt_to_pipeline_authorization(
        &self,
        method: &str,
        uri: &str,
        entity_body: &dyn Fn() -> Bytes,
    ) -> Option<String> {
        let mut state = self.digest.lock().ok()?;
        let challenge = state.last_challenge.clone()?;
        debug!("Pipelining digest authorization for {} {}", method, uri);
        self.authorize(&mut state, method, uri, &challenge, entity_body)
    }

    fn consume_authentication_info(&self, info: &HashMap<String, String>) {
        let Some(next_nonce) = info.get("nextnonce") else {
            return;
        };
        let Ok(mut state) = self.digest.lock() else {
            return;
        };
        if let Some(challenge) = state.last_challenge.as_mut() {
            challenge.insert("nonce".to_string(), next_nonce.clone());
            state.nonce_counts.insert(next_nonce.clone(), 0);
            debug!("Proxy rotated digest nonce");
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::parse_authentication_or_authorization_header;

    fn challenge(pairs: &[(&str, &str)]) -> DigestChallenge {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn no_body() -> Bytes {
        Bytes::new()
    }

    #[test]
    fn test_basic_value_is_cached() {
        let handler = AuthorizationChallengeHandler::new("Aladdin", "open sesame");
        let first = handler.handle_basic();
        assert_eq!(first, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert_eq!(handler.handle_basic(), first);
    }

    #[test]
    fn test_legacy_digest_response() {
        // RFC 2069 example values.
        let handler = AuthorizationChallengeHandler::new("Mufasa", "CircleOfLife");
        let c = challenge(&[
            ("realm", "testrealm@host.com"),
            ("nonce", "dcd98b7102dd2f0e8b11d0f600bfb0c093"),
            ("opaque", "5ccc069c403ebaf9f0171e9517f40e41"),
        ]);

        let header = handler
            .handle_digest("GET", "/dir/index.html", &[c], &no_body)
            .unwrap();
        let attributes = parse_authentication_or_authorization_header(&header);

        assert!(header.starts_with("Digest "));
        assert_eq!(attributes["response"], "1949323746fe6a43ef61f9606e7febea");
        assert_eq!(attributes["opaque"], "5ccc069c403ebaf9f0171e9517f40e41");
        assert!(!attributes.contains_key("qop"));
    }

    #[test]
    fn test_digest_prefers_strongest_algorithm() {
        let handler = AuthorizationChallengeHandler::new("user", "pass");
        let md5 = challenge(&[("realm", "r"), ("nonce", "n1"), ("qop", "auth")]);
        let sha = challenge(&[("realm", "r"), ("nonce", "n2"), ("qop", "auth"), ("algorithm", "SHA-256")]);

        let header = handler
            .handle_digest("CONNECT", "/", &[md5, sha], &no_body)
            .unwrap();
        let attributes = parse_authentication_or_authorization_header(&header);

        assert_eq!(attributes["algorithm"], "SHA-256");
        assert_eq!(attributes["nonce"], "n2");
        assert_eq!(attributes["nc"], "00000001");
        assert_eq!(attributes["response"].len(), 64);
    }

    #[test]
    fn test_digest_prefers_auth_over_auth_int_for_same_algorithm() {
        let handler = AuthorizationChallengeHandler::new("user", "pass");
        let auth = challenge(&[("realm", "r"), ("nonce", "n1"), ("qop", "auth")]);
        let auth_int = challenge(&[("realm", "r"), ("nonce", "n2"), ("qop", "auth-int")]);

        let header = handler
            .handle_digest("CONNECT", "/", &[auth.clone(), auth_int.clone()], &no_body)
            .unwrap();
        assert_eq!(parse_authentication_or_authorization_header(&header)["qop"], "auth");

        let header = handler
            .handle_digest("CONNECT", "/", &[auth_int, auth], &no_body)
            .unwrap();
        assert_eq!(parse_authentication_or_authorization_header(&header)["qop"], "auth");
    }

    #[test]
    fn test_equal_challenges_keep_the_first() {
        let handler = AuthorizationChallengeHandler::new("user", "pass");
        let first = challenge(&[("realm", "r"), ("nonce", "first"), ("qop", "auth")]);
        let second = challenge(&[("realm", "r"), ("nonce", "second"), ("qop", "auth")]);

        let header = handler.handle_digest("CONNECT", "/", &[first, second], &no_body).unwrap();
        assert_eq!(parse_authentication_or_authorization_header(&header)["nonce"], "first");
    }

    #[test]
    fn test_unsupported_challenges_yield_nothing() {
        let handler = AuthorizationChallengeHandler::new("user", "pass");
        let c = challenge(&[("realm", "r"), ("nonce", "n"), ("algorithm", "SHA-512-256")]);
        assert!(handler.handle_digest("CONNECT", "/", &[c], &no_body).is_none());
    }

    #[test]
    fn test_pipelining_counts_nonce_uses() {
        let handler = AuthorizationChallengeHandler::new("user", "pass");
        assert!(handler.attempt_to_pipeline_authorization("CONNECT", "/", &no_body).is_none());

        let c = challenge(&[("realm", "r"), ("nonce", "n"), ("qop", "auth")]);
        handler.handle_digest("CONNECT", "/", &[c], &no_body).unwrap();

        let pipelined = handler
            .attempt_to_pipeline_authorization("CONNECT", "/", &no_body)
            .unwrap();
        let attributes = parse_authentication_or_authorization_header(&pipelined);
        assert_eq!(attributes["nonce"], "n");
        assert_eq!(attributes["nc"], "00000002");
    }

    #[test]
    fn test_next_nonce_rotation() {
        let handler = AuthorizationChallengeHandler::new("user", "pass");
        let c = challenge(&[("realm", "r"), ("nonce", "old"), ("qop", "auth")]);
        handler.handle_digest("CONNECT", "/", &[c], &no_body).unwrap();

        let mut info = HashMap::new();
        info.insert("nextnonce".to_string(), "X".to_string());
        handler.consume_authentication_info(&info);

        let pipelined = handler
            .attempt_to_pipeline_authorization("CONNECT", "/", &no_body)
            .unwrap();
        let attributes = parse_authentication_or_authorization_header(&pipelined);
        assert_eq!(attributes["nonce"], "X");
        assert_eq!(attributes["nc"], "00000001");
    }

    #[test]
    fn test_auth_int_hashes_entity_body() {
        let handler = AuthorizationChallengeHandler::new("user", "pass");
        let c = challenge(&[("realm", "r"), ("nonce", "n"), ("qop", "auth-int")]);
        let called = std::cell::Cell::new(false);
        let body = || {
            called.set(true);
            Bytes::from_static(b"payload")
        };

        let header = handler.handle_digest("PUT", "/upload", &[c], &body).unwrap();
        assert!(called.get());
        assert!(header.contains("qop=auth-int"));
    }
}
