//! `state` parameter of the authorization-code flow.
//!
//! Wire format: `nonce` or `nonce|invitationToken`, random part first. The
//! nonce is echoed in a short-lived cookie and compared on callback.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};

const DELIMITER: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthState {
    pub nonce: String,
    pub invitation_token: Option<String>,
}

/// 24 random bytes, URL-safe base64 (never contains the delimiter).
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 24];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn encode(nonce: &str, invitation_token: Option<&str>) -> String {
    match invitation_token.filter(|t| !t.is_empty()) {
        Some(token) => format!("{}{}{}", nonce, DELIMITER, token),
        None => nonce.to_string(),
    }
}

/// `None` when the nonce part is empty.
pub fn decode(raw: &str) -> Option<OAuthState> {
    let (nonce, invitation) = match raw.split_once(DELIMITER) {
        Some((nonce, token)) => (nonce, Some(token).filter(|t| !t.is_empty())),
        None => (raw, None),
    };
    if nonce.is_empty() {
        return None;
    }
    Some(OAuthState {
        nonce: nonce.to_string(),
        invitation_token: invitation.map(str::to_string),
    })
}
