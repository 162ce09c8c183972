use super::{BASIC, DIGEST};
use arc_swap::ArcSwapOption;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

/// Attributes of one `Digest` challenge, keyed by lower-cased attribute name.
pub type DigestChallenge = HashMap<String, String>;

/// The challenge holder shared by every CONNECT attempt against one proxy.
pub type SharedChallengeHolder = Arc<ArcSwapOption<ChallengeHolder>>;

/// Snapshot of the challenges a proxy answered a CONNECT with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeHolder {
    has_basic_challenge: bool,
    digest_challenges: Vec<DigestChallenge>,
}

impl ChallengeHolder {
    pub fn new(has_basic_challenge: bool, digest_challenges: Vec<DigestChallenge>) -> Self {
        Self {
            has_basic_challenge,
            digest_challenges,
        }
    }

    /// Builds a holder from every `Proxy-Authenticate` value of a response.
    pub fn from_headers<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut holder = Self::default();
        for (scheme, attributes) in parse_challenges(values) {
            if scheme.eq_ignore_ascii_case(BASIC) {
                holder.has_basic_challenge = true;
            } else if scheme.eq_ignore_ascii_case(DIGEST) {
                holder.digest_challenges.push(attributes);
            } else {
                debug!("Ignoring unsupported proxy authentication scheme '{}'", scheme);
            }
        }
        holder
    }

    pub fn new_shared() -> SharedChallengeHolder {
        Arc::new(ArcSwapOption::empty())
    }

    pub fn has_basic_challenge(&self) -> bool {
        self.has_basic_challenge
    }

    pub fn has_digest_challenge(&self) -> bool {
        !self.digest_challenges.is_empty()
    }

    pub fn digest_challenges(&self) -> &[DigestChallenge] {
        &self.digest_challenges
    }

    pub fn is_empty(&self) -> bool {
        !self.has_basic_challenge && self.digest_challenges.is_empty()
    }
}

/// Replaces `observed` with `holder` in `shared`.
///
/// Returns false when another attempt published a different holder since
/// `observed` was loaded; the newer holder is kept in that case.
pub fn publish_challenge_holder(
    shared: &ArcSwapOption<ChallengeHolder>,
    observed: &Option<Arc<ChallengeHolder>>,
    holder: ChallengeHolder,
) -> bool {
    let previous = shared.compare_and_swap(observed, Some(Arc::new(holder)));
    same_holder(&previous, observed)
}

/// Empties `shared` if it still holds `observed`.
pub fn clear_challenge_holder(
    shared: &ArcSwapOption<ChallengeHolder>,
    observed: &Option<Arc<ChallengeHolder>>,
) -> bool {
    let previous = shared.compare_and_swap(observed, None);
    same_holder(&previous, observed)
}

fn same_holder(a: &Option<Arc<ChallengeHolder>>, b: &Option<Arc<ChallengeHolder>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Splits header values into `(scheme, attributes)` pairs.
///
/// A single value may carry several challenges, e.g.
/// `Basic realm="a", Digest realm="a", nonce="n"`.
pub fn parse_challenges<'a, I>(values: I) -> Vec<(String, HashMap<String, String>)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut challenges: Vec<(String, HashMap<String, String>)> = Vec::new();

    for value in values {
        for item in split_list(value) {
            let (scheme, rest) = split_scheme(item);
            if let Some(scheme) = scheme {
                challenges.push((scheme.to_string(), HashMap::new()));
            }
            if let Some((key, value)) = split_param(rest) {
                if let Some((_, attributes)) = challenges.last_mut() {
                    attributes.insert(key, value);
                }
            }
        }
    }

    challenges
}

/// Parses a `Proxy-Authorization`, `Proxy-Authenticate` or
/// `Proxy-Authentication-Info` value into its attributes. A leading scheme
/// token is skipped.
pub fn parse_authentication_or_authorization_header(value: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    for item in split_list(value) {
        let (_, rest) = split_scheme(item);
        if let Some((key, value)) = split_param(rest) {
            attributes.insert(key, value);
        }
    }
    attributes
}

// Comma separated items, ignoring commas inside quoted strings.
fn split_list(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.retain(|item| !item.is_empty());
    items
}

// "Digest realm=x" -> (Some("Digest"), "realm=x"); "Basic" -> (Some("Basic"), "")
fn split_scheme(item: &str) -> (Option<&str>, &str) {
    let token_end = item
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(item.len());
    let rest = item[token_end..].trim_start();

    if token_end == 0 || rest.starts_with('=') {
        return (None, item);
    }
    (Some(&item[..token_end]), rest)
}

fn split_param(param: &str) -> Option<(String, String)> {
    let (key, value) = param.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_ascii_lowercase(), unquote(value.trim())))
}

fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
