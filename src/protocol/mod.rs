//! Wire types for the TIDAL authentication services.
//!
//! # Submodules
//!
//! * [`auth`] - Token endpoint responses and authorization redirects
//! * [`status`] - Error bodies returned by the token endpoint and the API
//!
//! Secrets in these types are redacted from their `Debug` output, so parsed
//! responses can be logged at TRACE level.

pub mod auth;
pub mod status;

use std::fmt::Debug;

use serde::Deserialize;

use crate::error::Result;

/// Parses and logs JSON responses from TIDAL services.
///
/// # Arguments
///
/// * `body` - Response body to parse
/// * `origin` - Description of the endpoint for logging
///
/// # Errors
///
/// Returns `Protocol` if the body is not valid JSON or does not match `T`.
///
/// # Logging
///
/// * Success: Logs parsed structure at TRACE level
/// * Failure: Logs the parse error at ERROR level. The raw body is not
///   logged because it may contain tokens.
pub fn json<T>(body: &[u8], origin: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de> + Debug,
{
    match serde_json::from_slice(body) {
        Ok(result) => {
            trace!("{origin}: {result:#?}");
            Ok(result)
        }
        Err(e) => {
            error!("{origin}: failed parsing response ({e})");
            Err(e.into())
        }
    }
}
