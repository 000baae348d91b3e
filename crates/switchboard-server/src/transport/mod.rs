//! Transport adapters: each turns a client channel into a registered
//! [`Connection`](switchboard_core::Connection).

pub mod relay;
pub mod sse;
pub mod ws;

use serde::Deserialize;
use switchboard_core::{ConnectionToken, RecipientId};

use crate::api::ApiError;

/// Query string of `/ws` and `/sse`.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub recipient: String,
    /// Reusing a token replaces the earlier connection that holds it.
    #[serde(default)]
    pub token: Option<String>,
}

impl ConnectParams {
    pub fn resolve(self) -> Result<(RecipientId, ConnectionToken), ApiError> {
        let recipient = self.recipient.trim();
        if recipient.is_empty() {
            return Err(ApiError::BadRequest("recipient must not be empty".into()));
        }
        let token = match self.token.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => ConnectionToken::from(t),
            _ => ConnectionToken::generate(),
        };
        Ok((RecipientId::from(recipient), token))
    }
}
