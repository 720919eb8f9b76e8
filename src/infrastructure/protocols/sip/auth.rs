//! SIP Digest Authentication (RFC 2617, RFC 3261), client side

use super::message::SipError;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// Which challenge header the server sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 with `WWW-Authenticate`
    Www,
    /// 407 with `Proxy-Authenticate`
    Proxy,
}

impl ChallengeKind {
    pub fn from_status(code: u16) -> Option<Self> {
        match code {
            401 => Some(ChallengeKind::Www),
            407 => Some(ChallengeKind::Proxy),
            _ => None,
        }
    }

    /// Header carrying the challenge in the response
    pub fn challenge_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "www-authenticate",
            ChallengeKind::Proxy => "proxy-authenticate",
        }
    }

    /// Header carrying the credentials in the retried request
    pub fn authorization_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Parsed `WWW-Authenticate` / `Proxy-Authenticate` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: Option<String>,
    pub nonce: String,
    pub algorithm: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    pub fn parse(header_value: &str) -> Result<Self, SipError> {
        let value = header_value.trim();
        let params_str = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => {
                return Err(SipError::Authentication(format!(
                    "Unsupported challenge scheme: {}",
                    value
                )))
            }
        };

        let params = parse_params(params_str);
        let nonce = params
            .get("nonce")
            .filter(|n| !n.is_empty())
            .cloned()
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        Ok(Self {
            realm: params.get("realm").cloned(),
            nonce,
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
            stale: params
                .get("stale")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }

    /// True when the server offers `qop=auth` (possibly among others)
    pub fn supports_qop_auth(&self) -> bool {
        self.qop
            .as_deref()
            .map(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")))
            .unwrap_or(false)
    }
}

/// Split `key=value, key="quoted, value"` pairs; keys are lower-cased
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"').to_string();
            if !key.is_empty() {
                params.insert(key, value);
            }
        }
    }
    params
}

/// Account credentials used to answer a challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Used when the challenge carries no realm
    pub realm: String,
}

/// Header ready to insert into the retried request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationHeader {
    pub name: &'static str,
    pub value: String,
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

/// Digest response, RFC 2617 §3.2.2.1
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<&str>,
    nc: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    match qop {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Stateless digest responder; only the client nonce is fresh per call
#[derive(Debug, Clone, Default)]
pub struct DigestAuthenticator;

impl DigestAuthenticator {
    pub const NONCE_COUNT: &'static str = "00000001";

    pub fn new() -> Self {
        Self
    }

    pub fn generate_cnonce() -> String {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        hex::encode(bytes)
    }

    pub fn authorize(
        &self,
        challenge: &DigestChallenge,
        kind: ChallengeKind,
        method: &str,
        uri: &str,
        credentials: &Credentials,
    ) -> AuthorizationHeader {
        self.authorize_with_cnonce(
            challenge,
            kind,
            method,
            uri,
            credentials,
            &Self::generate_cnonce(),
        )
    }

    pub fn authorize_with_cnonce(
        &self,
        challenge: &DigestChallenge,
        kind: ChallengeKind,
        method: &str,
        uri: &str,
        credentials: &Credentials,
        cnonce: &str,
    ) -> AuthorizationHeader {
        let realm = challenge
            .realm
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(&credentials.realm);
        let qop = challenge.supports_qop_auth().then_some("auth");

        let response = compute_response(
            &credentials.username,
            &credentials.password,
            realm,
            &challenge.nonce,
            method,
            uri,
            qop,
            Self::NONCE_COUNT,
            cnonce,
        );

        let mut value = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            credentials.username, realm, challenge.nonce, uri, response, challenge.algorithm
        );
        if qop.is_some() {
            value.push_str(&format!(
                ", qop=auth, nc={}, cnonce=\"{}\"",
                Self::NONCE_COUNT,
                cnonce
            ));
        }
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }

        debug!(
            "Answering {} challenge for {} {} (realm {})",
            kind.challenge_header(),
            method,
            uri,
            realm
        );

        AuthorizationHeader {
            name: kind.authorization_header(),
            value,
        }
    }
}
