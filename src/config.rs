//! Configuration for the TIDAL session.
//!
//! Holds the endpoints, OAuth parameters and timing policy used by the
//! [`SessionManager`](crate::session::SessionManager). The defaults match
//! what the official Android application sends; endpoints can be
//! overridden to point at a test server.
//!
//! # Timing Policy
//!
//! * Tokens are refreshed when they expire within [`Config::expiry_margin`]
//! * Token endpoint requests time out after [`Config::request_timeout`]
//! * Failed refreshes are retried [`Config::max_refresh_retries`] times with
//!   exponential backoff

use std::time::Duration;

use url::Url;

/// Browser endpoint where the user logs in.
pub const AUTHORIZE_URL: &str = "https://login.tidal.com/authorize";

/// OAuth token endpoint for both code exchange and refresh.
pub const TOKEN_URL: &str = "https://auth.tidal.com/v1/oauth2/token";

/// Redirect URI registered for the Android application.
pub const REDIRECT_URI: &str = "https://tidal.com/android/login/auth";

/// Base URL of the authorized REST API.
pub const API_BASE_URL: &str = "https://api.tidal.com/v1/";

/// Scopes requested by the Android application.
pub const SCOPE: &str = "r_usr w_usr w_sub";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// Two-letter language code sent as `lang` to the login page.
    pub app_lang: String,

    pub user_agent: String,

    pub authorize_url: Url,
    pub token_url: Url,
    pub redirect_uri: Url,
    pub api_base_url: Url,

    pub scope: String,

    /// Opaque `state` to send with the authorization request.
    ///
    /// The Android application sends none. When set, the redirect must
    /// echo it back unchanged.
    pub state: Option<String>,

    /// Upper bound for each request to the token endpoint.
    pub request_timeout: Duration,

    /// Tokens expiring within this margin are considered expired.
    pub expiry_margin: Duration,

    /// How many times a failed refresh is retried before giving up.
    pub max_refresh_retries: u32,

    /// Shortest delay between refresh attempts.
    pub retry_min_delay: Duration,

    /// Longest delay between refresh attempts.
    pub retry_max_delay: Duration,
}

impl Config {
    /// Default bound for token endpoint requests.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default margin before expiry at which tokens are refreshed.
    pub const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

    /// Default number of refresh retries.
    pub const MAX_REFRESH_RETRIES: u32 = 1;

    /// Creates a configuration with the Android application's parameters.
    ///
    /// # Panics
    ///
    /// Panics if the application name, version or language, or the OS name
    /// or version, cannot be used in a `User-Agent` header.
    #[must_use]
    pub fn new() -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();
        let app_lang = "en".to_owned();

        // Additional `User-Agent` string checks on top of `reqwest::HeaderValue`.
        let illegal_chars = |chr| chr == '/' || chr == ';';
        if app_name.is_empty()
            || app_name.contains(illegal_chars)
            || app_version.is_empty()
            || app_version.contains(illegal_chars)
            || app_lang.chars().count() != 2
            || app_lang.contains(illegal_chars)
        {
            panic!(
                "application name, version and/or language invalid (\"{app_name}\"; \"{app_version}\"; \"{app_lang}\")"
            );
        }

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        if os_name.is_empty()
            || os_name.contains(illegal_chars)
            || os_version.is_empty()
            || os_version.contains(illegal_chars)
        {
            panic!("os name and/or version invalid (\"{os_name}\"; \"{os_version}\")");
        }

        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version}; {app_lang})");
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            app_lang,

            user_agent,

            authorize_url: Url::parse(AUTHORIZE_URL).expect("invalid authorize url"),
            token_url: Url::parse(TOKEN_URL).expect("invalid token url"),
            redirect_uri: Url::parse(REDIRECT_URI).expect("invalid redirect uri"),
            api_base_url: Url::parse(API_BASE_URL).expect("invalid api base url"),

            scope: SCOPE.to_owned(),
            state: None,

            request_timeout: Self::REQUEST_TIMEOUT,
            expiry_margin: Self::EXPIRY_MARGIN,
            max_refresh_retries: Self::MAX_REFRESH_RETRIES,
            retry_min_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(5),
        }
    }

    /// Points all endpoints at `base`, keeping their paths.
    ///
    /// Used to talk to a local mock of the TIDAL services.
    ///
    /// # Errors
    ///
    /// Returns an error if `base` cannot be joined with the endpoint paths.
    pub fn with_base_url(mut self, base: &Url) -> crate::error::Result<Self> {
        self.authorize_url = base.join("authorize")?;
        self.token_url = base.join("v1/oauth2/token")?;
        self.api_base_url = base.join("v1/")?;
        Ok(self)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
