//! Session token signing and verification

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &str, session_id: &str, player_id: &str) -> Result<HmacSha256, AuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(format!("{}:{}", session_id, player_id).as_bytes());
    Ok(mac)
}

/// Token allowing `player_id` to join `session_id`:
/// base64url(HMAC-SHA256(secret, "{session}:{player}"))
pub fn sign_session_token(
    secret: &str,
    session_id: &str,
    player_id: &str,
) -> Result<String, AuthError> {
    let mac = mac_for(secret, session_id, player_id)?;
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Check a token in constant time
pub fn verify_session_token(
    secret: &str,
    session_id: &str,
    player_id: &str,
    token: &str,
) -> Result<(), AuthError> {
    if player_id.is_empty() {
        return Err(AuthError::MissingPlayer);
    }
    let provided = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| AuthError::InvalidFormat)?;
    mac_for(secret, session_id, player_id)?
        .verify_slice(&provided)
        .map_err(|_| AuthError::InvalidToken)
}

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing player id")]
    MissingPlayer,

    #[error("Invalid token format")]
    InvalidFormat,

    #[error("Invalid token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingPlayer => StatusCode::BAD_REQUEST,
            AuthError::InvalidFormat => StatusCode::UNAUTHORIZED,
            AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
        };

        (status, self.to_string()).into_response()
    }
}
