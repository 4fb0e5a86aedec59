//! Error bodies returned by TIDAL services.
//!
//! The REST API and the token endpoint answer failures with:
//!
//! ```json
//! {
//!     "status": 401,
//!     "subStatus": 11003,
//!     "userMessage": "The token has expired. (Expired on time)"
//! }
//! ```
//!
//! The token endpoint may instead use the OAuth error form:
//!
//! ```json
//! {
//!     "error": "invalid_grant",
//!     "error_description": "Authorization code has expired"
//! }
//! ```
//!
//! Both forms are parsed into a single [`ErrorBody`].

use std::fmt;

use serde::Deserialize;

/// `subStatus` of a 401 on API calls when the access token has expired.
pub const EXPIRED_TOKEN_SUB_STATUS: u32 = 11003;

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    #[serde(default)]
    pub status: Option<u16>,

    #[serde(default)]
    pub sub_status: Option<u32>,

    #[serde(default)]
    pub user_message: Option<String>,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default, rename = "error_description")]
    pub error_description: Option<String>,
}

impl ErrorBody {
    /// Parses an error body, falling back to the HTTP status when the body
    /// is not JSON.
    #[must_use]
    pub fn parse(status: http::StatusCode, body: &[u8]) -> Self {
        let mut parsed = serde_json::from_slice::<Self>(body).unwrap_or_else(|e| {
            debug!("error body is not json ({e})");
            Self::default()
        });

        if parsed.status.is_none() {
            parsed.status = Some(status.as_u16());
        }

        parsed
    }

    /// Whether an API call failed because the access token expired.
    #[must_use]
    pub fn is_expired_token(&self) -> bool {
        self.status == Some(401) && self.sub_status == Some(EXPIRED_TOKEN_SUB_STATUS)
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.status.unwrap_or_default())?;
        if let Some(sub_status) = self.sub_status {
            write!(f, " (sub status {sub_status})")?;
        }
        if let Some(ref error) = self.error {
            write!(f, ": {error}")?;
        }
        if let Some(message) = self.user_message.as_ref().or(self.error_description.as_ref()) {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorBody {}
