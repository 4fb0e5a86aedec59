use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, TimestampSeconds};
use veil::Redact;

use crate::{
    error::{Error, Result},
    protocol::auth::TokenResponse,
};

/// Access and refresh tokens of an authenticated session.
///
/// A `TokenSet` is never changed after it is created: a refresh produces a
/// new one that supersedes it. It serializes so that sessions can be
/// persisted and resumed.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Redact)]
pub struct TokenSet {
    #[redact]
    pub access_token: String,

    #[redact]
    pub refresh_token: String,

    pub token_type: String,

    #[serde_as(as = "TimestampSeconds<i64>")]
    pub expires_at: SystemTime,

    pub scope: String,

    pub user_id: Option<u64>,

    pub country_code: Option<String>,
}

impl TokenSet {
    /// Builds a token set from a token endpoint response.
    ///
    /// `issued_at` is the time the request was sent, so that network latency
    /// shortens the lifetime rather than extending it. When the response has
    /// no refresh token, `prior` is carried forward.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the response has an empty access token, or has
    /// no refresh token and there is none to carry forward.
    pub fn from_response(
        response: TokenResponse,
        issued_at: SystemTime,
        prior: Option<&Self>,
        requested_scope: &str,
    ) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(Error::protocol("token response has empty access token"));
        }

        let user_id = response.user_id().or_else(|| prior.and_then(|p| p.user_id));
        let country_code = response
            .country_code()
            .map(ToOwned::to_owned)
            .or_else(|| prior.and_then(|p| p.country_code.clone()));

        let refresh_token = match (response.refresh_token, prior) {
            (Some(token), _) if !token.is_empty() => token,
            (_, Some(prior)) => {
                debug!("no refresh token in response, keeping the previous one");
                prior.refresh_token.clone()
            }
            _ => return Err(Error::protocol("token response has no refresh token")),
        };

        let expires_at = issued_at
            .checked_add(response.expires_in)
            .unwrap_or(issued_at);

        Ok(Self {
            access_token: response.access_token,
            refresh_token,
            token_type: response.token_type,
            expires_at,
            scope: response.scope.unwrap_or_else(|| requested_scope.to_owned()),
            user_id,
            country_code,
        })
    }

    /// Creates a token set that only holds a refresh token, to be refreshed
    /// before first use.
    #[must_use]
    pub fn from_refresh_token(refresh_token: String, scope: &str) -> Self {
        Self {
            access_token: String::new(),
            refresh_token,
            token_type: String::from("Bearer"),
            expires_at: SystemTime::UNIX_EPOCH,
            scope: scope.to_owned(),
            user_id: None,
            country_code: None,
        }
    }

    #[must_use]
    pub fn time_to_live(&self) -> Duration {
        self.expires_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expires_at
    }

    /// Whether the access token expires within `margin` from now.
    #[must_use]
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.access_token.is_empty() || self.time_to_live() <= margin
    }

    /// Value for the `Authorization` header, for example `Bearer abc`.
    #[must_use]
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}
