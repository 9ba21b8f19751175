//! SIP Digest Authentication (RFC 2617, RFC 3261)
//!
//! Client side only: answers a `WWW-Authenticate` / `Proxy-Authenticate`
//! challenge by adding `Authorization` / `Proxy-Authorization` to the
//! outbound request.

use super::message::{SipError, SipRequest, SipResponse};
use crate::domain::registration::RegistrationSession;
use rand::Rng;
use rsip::{Header, Headers};
use std::collections::HashMap;
use tracing::debug;

/// Nonce count; each challenge is answered exactly once
const NONCE_COUNT: &str = "00000001";

/// User credentials for authentication
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub username: String,
    pub password: String,
}

impl UserCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Which header carried the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 with `WWW-Authenticate`
    Www,
    /// 407 with `Proxy-Authenticate`
    Proxy,
}

/// Digest algorithm announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
}

impl DigestAlgorithm {
    fn parse(value: Option<&str>) -> Result<Self, SipError> {
        match value {
            None => Ok(DigestAlgorithm::Md5),
            Some(value) if value.eq_ignore_ascii_case("MD5") => Ok(DigestAlgorithm::Md5),
            Some(value) if value.eq_ignore_ascii_case("MD5-sess") => Ok(DigestAlgorithm::Md5Sess),
            Some(other) => Err(SipError::Authentication(format!(
                "Unsupported digest algorithm: {}",
                other
            ))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
        }
    }
}

/// Authentication challenge sent by the registrar
#[derive(Debug, Clone)]
pub struct AuthChallenge {
    pub kind: ChallengeKind,
    pub realm: Option<String>,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: DigestAlgorithm,
    pub qop: Vec<String>,
    pub stale: bool,
}

impl AuthChallenge {
    /// Extract the challenge from a 401/407 response
    pub fn from_response(response: &SipResponse) -> Result<Self, SipError> {
        let (kind, value) = match response.status_code() {
            401 => (ChallengeKind::Www, response.www_authenticate()),
            407 => (ChallengeKind::Proxy, response.proxy_authenticate()),
            other => {
                return Err(SipError::Authentication(format!(
                    "Status {} is not a challenge",
                    other
                )))
            }
        };

        let value = value.ok_or_else(|| {
            SipError::Authentication(format!(
                "{} challenge without authenticate header",
                response.status_code()
            ))
        })?;

        Self::parse(kind, &value)
    }

    /// Parse a `Digest ...` header value
    pub fn parse(kind: ChallengeKind, value: &str) -> Result<Self, SipError> {
        let value = value.trim();
        let params = match value.split_once(char::is_whitespace) {
            Some((scheme, params)) if scheme.eq_ignore_ascii_case("Digest") => params,
            _ => {
                return Err(SipError::Authentication(format!(
                    "Unsupported authentication scheme: {}",
                    value
                )))
            }
        };

        let params = parse_digest_params(params);
        let nonce = params
            .get("nonce")
            .cloned()
            .ok_or_else(|| SipError::Authentication("Missing nonce in challenge".to_string()))?;

        Ok(Self {
            kind,
            realm: params.get("realm").cloned(),
            nonce,
            opaque: params.get("opaque").cloned(),
            algorithm: DigestAlgorithm::parse(params.get("algorithm").map(String::as_str))?,
            qop: params
                .get("qop")
                .map(|qop| {
                    qop.split(',')
                        .map(|q| q.trim().to_ascii_lowercase())
                        .filter(|q| !q.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            stale: params
                .get("stale")
                .map(|stale| stale.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

/// Parse Digest authentication parameters.
///
/// Commas inside quoted values (e.g. `qop="auth,auth-int"`) do not split.
pub fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            if !key.is_empty() {
                params.insert(key, value.to_string());
            }
        }
    }

    params
}

/// Computes Digest responses and signs outbound requests
pub struct DigestAuthenticator;

impl DigestAuthenticator {
    /// Answer the challenge carried by `challenge_response` by adding the
    /// matching authorization header to `request`.
    ///
    /// The realm comes from the challenge, falling back to the one kept in
    /// `session`. Returns the realm that was used.
    pub fn authorize(
        session: Option<&RegistrationSession>,
        request: &mut SipRequest,
        challenge_response: &SipResponse,
        credentials: &UserCredentials,
    ) -> Result<String, SipError> {
        let challenge = AuthChallenge::from_response(challenge_response)?;

        let realm = challenge
            .realm
            .clone()
            .or_else(|| session.map(|s| s.realm().to_string()))
            .ok_or_else(|| SipError::Authentication("Missing realm in challenge".to_string()))?;

        let qop = if challenge.qop.is_empty() {
            None
        } else if challenge.qop.iter().any(|q| q == "auth") {
            Some("auth")
        } else {
            return Err(SipError::Authentication(format!(
                "Unsupported qop: {}",
                challenge.qop.join(",")
            )));
        };

        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let cnonce = generate_cnonce();

        let response = Self::calculate_response(
            challenge.algorithm,
            &credentials.username,
            &credentials.password,
            &realm,
            &challenge.nonce,
            &method,
            &uri,
            qop,
            NONCE_COUNT,
            &cnonce,
        );

        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            credentials.username,
            realm,
            challenge.nonce,
            uri,
            response,
            challenge.algorithm.as_str()
        );
        if let Some(qop) = qop {
            value.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, NONCE_COUNT, cnonce));
        }
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }

        // Replace any credentials from an earlier challenge
        let headers: Vec<Header> = request
            .headers()
            .iter()
            .filter(|h| !matches!(h, Header::Authorization(_) | Header::ProxyAuthorization(_)))
            .cloned()
            .collect();
        request.inner.headers = Headers::from(headers);

        request.push_header(match challenge.kind {
            ChallengeKind::Www => Header::Authorization(value.into()),
            ChallengeKind::Proxy => Header::ProxyAuthorization(value.into()),
        });

        debug!(
            "Signed {} for {}@{} (qop: {:?}, stale: {})",
            method, credentials.username, realm, qop, challenge.stale
        );
        Ok(realm)
    }

    /// Calculate digest response
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_response(
        algorithm: DigestAlgorithm,
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
        // HA1 = MD5(username:realm:password)
        let mut ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
        if algorithm == DigestAlgorithm::Md5Sess {
            ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, cnonce)));
        }

        // HA2 = MD5(method:uri)
        let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));

        // Response = MD5(HA1:nonce:HA2) or MD5(HA1:nonce:nc:cnonce:qop:HA2)
        let digest = match qop {
            Some(qop) => md5::compute(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, nonce, nc, cnonce, qop, ha2
            )),
            None => md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)),
        };
        format!("{:x}", digest)
    }
}

/// Random client nonce
fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}
