//! Unofficial client session for the TIDAL mobile API.
//!
//! Authenticates through the OAuth2 PKCE flow of the Android application and
//! keeps a bearer token valid for downstream API calls. Start with
//! [`session::SessionManager`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod api;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod pkce;
pub mod protocol;
pub mod session;
pub mod tokens;
