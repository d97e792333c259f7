/// Client identification for rate limiting and session binding
///
/// Raw IP addresses never leave this module; everything downstream sees the
/// keyed hash.
use crate::{context::AppContext, crypto::CredentialVault, error::HoleError, error::HoleResult};
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts, HeaderMap},
};
use std::net::{IpAddr, SocketAddr};

/// Placeholder when the client address or agent cannot be determined
pub const UNKNOWN_CLIENT: &str = "unknown";

const MAX_USER_AGENT_LEN: usize = 512;

/// Hashed client address and user agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip_hash: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn from_parts(
        parts: &Parts,
        vault: &CredentialVault,
        trust_forwarded_for: bool,
    ) -> HoleResult<Self> {
        let ip_hash = match client_ip(parts, trust_forwarded_for) {
            Some(ip) => vault.hash_ip(&ip.to_string())?,
            None => UNKNOWN_CLIENT.to_string(),
        };

        Ok(Self {
            ip_hash,
            user_agent: user_agent(&parts.headers),
        })
    }
}

/// Peer address, or the hop the trusted proxy appended to `X-Forwarded-For`
///
/// Earlier hops are client-supplied and ignored.
pub fn client_ip(parts: &Parts, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = parts
            .headers
            .get_all("x-forwarded-for")
            .iter()
            .last()
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn user_agent(headers: &HeaderMap) -> String {
    headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.chars().take(MAX_USER_AGENT_LEN).collect())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Compare a stored fingerprint component with the current one
///
/// Only an unknown stored side matches anything; a client that drops a header
/// it was bound with does not.
pub fn fingerprint_matches(stored: Option<&str>, current: &str) -> bool {
    match stored {
        None => true,
        Some(stored) if stored == UNKNOWN_CLIENT => true,
        Some(stored) => crate::crypto::secure_compare(stored, current),
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for ClientInfo {
    type Rejection = HoleError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        ClientInfo::from_parts(parts, &state.vault, state.config.security.trust_forwarded_for)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use secrecy::SecretString;

    fn vault() -> CredentialVault {
        CredentialVault::new(
            SecretString::from("00".repeat(32)),
            SecretString::from("ip-hash-secret-value".to_string()),
        )
    }

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_peer_address_is_hashed() {
        let mut p = parts(Request::builder().header("user-agent", "curl/8"));
        p.extensions
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 5555))));

        let v = vault();
        let info = ClientInfo::from_parts(&p, &v, false).unwrap();
        assert_eq!(info.ip_hash, v.hash_ip("10.0.0.7").unwrap());
        assert_ne!(info.ip_hash, "10.0.0.7");
        assert_eq!(info.user_agent, "curl/8");
    }

    #[test]
    fn test_forwarded_for_only_when_trusted() {
        let mut p = parts(
            Request::builder().header("x-forwarded-for", "198.51.100.4, 203.0.113.9"),
        );
        p.extensions
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 80))));

        assert_eq!(
            client_ip(&p, true),
            Some("203.0.113.9".parse().unwrap())
        );
        assert_eq!(client_ip(&p, false), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_spoofed_leading_hop_does_not_change_hash() {
        let v = vault();
        let hash_for = |forwarded: &str| {
            let p = parts(Request::builder().header("x-forwarded-for", forwarded));
            ClientInfo::from_parts(&p, &v, true).unwrap().ip_hash
        };

        let honest = hash_for("203.0.113.9");
        assert_eq!(hash_for("1.2.3.4, 203.0.113.9"), honest);
        assert_eq!(hash_for("5.6.7.8, 9.9.9.9, 203.0.113.9"), honest);
        assert_eq!(honest, v.hash_ip("203.0.113.9").unwrap());
    }

    #[test]
    fn test_missing_address_is_unknown() {
        let p = parts(Request::builder());
        let info = ClientInfo::from_parts(&p, &vault(), false).unwrap();
        assert_eq!(info.ip_hash, UNKNOWN_CLIENT);
        assert_eq!(info.user_agent, UNKNOWN_CLIENT);
    }

    #[test]
    fn test_fingerprint_matching() {
        assert!(fingerprint_matches(Some("abc"), "abc"));
        assert!(!fingerprint_matches(Some("abc"), "abd"));
        assert!(fingerprint_matches(None, "abc"));
        assert!(fingerprint_matches(Some(UNKNOWN_CLIENT), "abc"));
        // A client that drops a header cannot match a bound fingerprint
        assert!(!fingerprint_matches(Some("abc"), UNKNOWN_CLIENT));
    }
}
