//! OAuth token responses and authorization redirects.
//!
//! # Token Response
//!
//! Returned by `POST /v1/oauth2/token` for both the code exchange and the
//! refresh grant:
//!
//! ```json
//! {
//!     "access_token": "secret_token",
//!     "refresh_token": "secret_refresh_token",
//!     "token_type": "Bearer",
//!     "expires_in": 604800,
//!     "scope": "r_usr w_usr w_sub",
//!     "user": {
//!         "userId": 123456789,
//!         "countryCode": "NL"
//!     },
//!     "user_id": 123456789
//! }
//! ```
//!
//! Refresh responses may omit `refresh_token`, in which case the previous
//! one stays valid.
//!
//! # Redirect
//!
//! After login the web view is sent to the registered redirect URI:
//!
//! ```text
//! https://tidal.com/android/login/auth?code=...&state=...
//! ```

use std::time::Duration;

use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DisplayFromStr, DurationSeconds, PickFirst};
use url::Url;
use veil::Redact;

use crate::error::{Error, Result};

/// Token endpoint response.
#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Redact)]
pub struct TokenResponse {
    #[redact]
    pub access_token: String,

    /// Absent on some refresh responses.
    #[redact]
    #[serde(default)]
    pub refresh_token: Option<String>,

    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Lifetime of the access token from the moment it was issued.
    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub expires_in: Duration,

    #[serde(default)]
    pub scope: Option<String>,

    #[serde(default)]
    pub user: Option<TokenUser>,

    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub user_id: Option<u64>,
}

/// Account the tokens were issued for.
#[serde_as]
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUser {
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub user_id: Option<u64>,

    /// Needed as `countryCode` on catalog requests.
    #[serde(default)]
    pub country_code: Option<String>,
}

fn default_token_type() -> String {
    String::from("Bearer")
}

impl TokenResponse {
    /// The user id from either the nested `user` object or the top level.
    #[must_use]
    pub fn user_id(&self) -> Option<u64> {
        self.user
            .as_ref()
            .and_then(|user| user.user_id)
            .or(self.user_id)
    }

    #[must_use]
    pub fn country_code(&self) -> Option<&str> {
        self.user
            .as_ref()
            .and_then(|user| user.country_code.as_deref())
    }
}

/// Query parameters of the captured redirect.
#[derive(Clone, Eq, PartialEq, Redact)]
pub struct AuthorizationRedirect {
    #[redact]
    pub code: String,
    pub state: Option<String>,
}

impl AuthorizationRedirect {
    /// Parses the redirect the web view was sent to after login.
    ///
    /// # Errors
    ///
    /// * `Protocol` if the URL is malformed, does not point at
    ///   `redirect_uri`, or has no `code`
    /// * `AuthorizationFailed` if the server redirected with an `error`,
    ///   for example because the user cancelled the login
    pub fn parse(redirect_url: &str, redirect_uri: &Url) -> Result<Self> {
        let url = Url::parse(redirect_url.trim())
            .map_err(|e| Error::protocol(format!("redirect url malformed: {e}")))?;

        if url.scheme() != redirect_uri.scheme()
            || url.host_str() != redirect_uri.host_str()
            || url.path() != redirect_uri.path()
        {
            return Err(Error::protocol(format!(
                "redirect does not match {redirect_uri}"
            )));
        }

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut error_description = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => error_description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Err(Error::authorization_failed(match error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            }));
        }

        match code {
            Some(code) if !code.is_empty() => Ok(Self { code, state }),
            _ => Err(Error::protocol("redirect has no authorization code")),
        }
    }
}
