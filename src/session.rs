//! OAuth2 PKCE session management for the TIDAL mobile API.
//!
//! The [`SessionManager`] owns the whole token lifecycle:
//!
//! 1. [`begin_authorization`](SessionManager::begin_authorization) builds the
//!    login URL for a web view, with a fresh PKCE challenge
//! 2. [`complete_authorization`](SessionManager::complete_authorization)
//!    exchanges the code from the captured redirect for tokens
//! 3. [`valid_token`](SessionManager::valid_token) hands out an access token
//!    that is valid at time of use, refreshing it when it is about to expire
//!
//! # Concurrency
//!
//! The manager is cheap to clone and all clones share one session. Refreshes
//! are single-flight: callers that find the token expired while a refresh is
//! in progress wait for it and share its outcome instead of starting their
//! own. The refresh runs in its own task, so it completes and installs its
//! result even when the caller that started it is cancelled.
//!
//! # Reactive Re-authentication
//!
//! API callers that get a `401` with `subStatus` 11003 should call
//! [`refresh_rejected`](SessionManager::refresh_rejected) with the rejected
//! token and retry their request once. See [`api::Client`](crate::api::Client).
//!
//! # Example
//!
//! ```rust
//! let session = SessionManager::new(Config::new(), identity)?;
//!
//! let (url, pending) = session.begin_authorization()?;
//! let redirect = web_view.open(url).await;
//! session.complete_authorization(pending, &redirect).await?;
//!
//! let token = session.access_token().await?;
//! ```

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use exponential_backoff::Backoff;
use url::Url;

use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
    http::Client as HttpClient,
    identity::ClientIdentity,
    pkce::PkceChallenge,
    protocol::{
        self,
        auth::{AuthorizationRedirect, TokenResponse},
        status::ErrorBody,
    },
    tokens::TokenSet,
};

/// Manages authorization and the current [`TokenSet`].
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

/// Authorization that is waiting for the redirect from the web view.
///
/// Holds the PKCE verifier, so it must be kept private and handed back to
/// [`SessionManager::complete_authorization`], which consumes it.
#[derive(Debug)]
pub struct PendingAuthorization {
    pkce: PkceChallenge,
    state: Option<String>,
}

impl PendingAuthorization {
    /// The challenge sent to the authorize endpoint.
    #[must_use]
    pub fn challenge(&self) -> &str {
        self.pkce.challenge()
    }
}

struct Inner {
    config: Config,
    identity: ClientIdentity,
    http_client: Arc<HttpClient>,
    state: Mutex<State>,

    /// Held for the duration of a refresh, including retries.
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Outcome of the last refresh, shareable with callers that waited for it.
type RefreshOutcome = std::result::Result<Arc<TokenSet>, (ErrorKind, String)>;

#[derive(Default)]
struct State {
    tokens: Option<Arc<TokenSet>>,

    /// Bumped whenever the tokens are replaced or a refresh completes.
    generation: u64,

    last_refresh: Option<RefreshOutcome>,
}

impl SessionManager {
    /// Creates an unauthenticated session.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the identity is malformed or the HTTP
    /// client cannot be built.
    pub fn new(config: Config, identity: ClientIdentity) -> Result<Self> {
        identity.validate()?;
        let http_client = Arc::new(HttpClient::new(&config)?);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                identity,
                http_client,
                state: Mutex::new(State::default()),
                refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        })
    }

    /// Builds the URL to open in a web view, and the pending authorization
    /// to complete once the web view is redirected.
    ///
    /// No network call is made.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the client identity is malformed.
    pub fn begin_authorization(&self) -> Result<(Url, PendingAuthorization)> {
        let config = &self.inner.config;
        let identity = &self.inner.identity;
        identity.validate()?;

        let pkce = PkceChallenge::generate();

        let mut url = config.authorize_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", config.redirect_uri.as_str())
                .append_pair("client_id", identity.client_id())
                .append_pair("lang", &config.app_lang)
                .append_pair("appMode", "android")
                .append_pair("client_unique_key", identity.client_unique_key())
                .append_pair("code_challenge", pkce.challenge())
                .append_pair("code_challenge_method", pkce.method())
                .append_pair("restrict_signup", "true");
            if let Some(ref state) = config.state {
                query.append_pair("state", state);
            }
        }

        debug!("authorization started with challenge {pkce}");
        Ok((
            url,
            PendingAuthorization {
                pkce,
                state: config.state.clone(),
            },
        ))
    }

    /// Exchanges the code in the captured redirect for tokens and makes them
    /// current.
    ///
    /// # Errors
    ///
    /// * `Protocol` if the redirect is malformed, has no `code`, or has a
    ///   mismatched `state`. No request is made.
    /// * `AuthorizationFailed` if the server rejects the code. Start over
    ///   with [`begin_authorization`](Self::begin_authorization).
    /// * `Transient` on network failure or server error. The exchange is
    ///   retried once when no response was received.
    pub async fn complete_authorization(
        &self,
        pending: PendingAuthorization,
        redirect_url: &str,
    ) -> Result<Arc<TokenSet>> {
        let config = &self.inner.config;
        let identity = &self.inner.identity;

        let redirect = AuthorizationRedirect::parse(redirect_url, &config.redirect_uri)?;
        if let Some(ref expected) = pending.state {
            if redirect.state.as_ref() != Some(expected) {
                return Err(Error::protocol("redirect state does not match"));
            }
        }

        let params = [
            ("code", redirect.code.as_str()),
            ("client_id", identity.client_id()),
            ("grant_type", "authorization_code"),
            ("redirect_uri", config.redirect_uri.as_str()),
            ("scope", config.scope.as_str()),
            ("code_verifier", pending.pkce.verifier()),
            ("client_unique_key", identity.client_unique_key()),
        ];

        // The code is only spent once the server answers, so a request that
        // never got a response can be sent once more.
        let mut retried = false;
        let (response, issued_at) = loop {
            let issued_at = SystemTime::now();
            let request = self
                .inner
                .http_client
                .post_form(config.token_url.clone(), &params);
            match self.inner.http_client.execute(request).await {
                Ok(response) => break (response, issued_at),
                Err(e) if e.is_retryable() && !retried => {
                    warn!("code exchange failed, retrying once: {e}");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        };

        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            let response: TokenResponse = protocol::json(&body, "code exchange")?;
            let tokens = Arc::new(TokenSet::from_response(
                response,
                issued_at,
                None,
                &config.scope,
            )?);
            self.inner.install(Some(Arc::clone(&tokens)))?;

            match tokens.user_id {
                Some(user_id) => info!("logged in as user {user_id}"),
                None => info!("logged in"),
            }
            return Ok(tokens);
        }

        let error = ErrorBody::parse(status, &body);
        if status.is_client_error() && status != http::StatusCode::TOO_MANY_REQUESTS {
            warn!("authorization code rejected: {error}");
            Err(Error::authorization_failed(error))
        } else {
            Err(Error::transient(error))
        }
    }

    /// Runs the complete interactive login.
    ///
    /// `host` receives the authorization URL, shows it to the user, and
    /// resolves to the URL the web view was redirected to.
    ///
    /// # Errors
    ///
    /// Returns any error of [`begin_authorization`](Self::begin_authorization),
    /// of `host`, or of [`complete_authorization`](Self::complete_authorization).
    pub async fn login<F, Fut>(&self, host: F) -> Result<Arc<TokenSet>>
    where
        F: FnOnce(Url) -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let (url, pending) = self.begin_authorization()?;
        let redirect_url = host(url).await?;
        self.complete_authorization(pending, &redirect_url).await
    }

    /// Returns tokens that are valid for at least the configured expiry
    /// margin, refreshing them first if necessary.
    ///
    /// Returns without touching the network while the current tokens are
    /// fresh.
    ///
    /// # Errors
    ///
    /// * `NotAuthenticated` if no login has completed
    /// * Any error of [`refresh`](Self::refresh)
    pub async fn valid_token(&self) -> Result<Arc<TokenSet>> {
        let (tokens, generation) = self.inner.snapshot()?;
        match tokens {
            None => Err(Error::not_authenticated("no tokens; log in first")),
            Some(tokens) if !tokens.expires_within(self.inner.config.expiry_margin) => Ok(tokens),
            Some(tokens) => {
                debug!(
                    "access token expires in {}s, refreshing",
                    tokens.time_to_live().as_secs()
                );
                self.refresh_single_flight(generation).await
            }
        }
    }

    /// Returns an access token valid at time of use.
    ///
    /// # Errors
    ///
    /// See [`valid_token`](Self::valid_token).
    pub async fn access_token(&self) -> Result<String> {
        self.valid_token()
            .await
            .map(|tokens| tokens.access_token.clone())
    }

    /// Exchanges the refresh token for new tokens.
    ///
    /// If a refresh is already in progress, waits for it and returns its
    /// outcome.
    ///
    /// # Errors
    ///
    /// * `NotAuthenticated` if there are no tokens
    /// * `ReauthenticationRequired` if the refresh token was rejected; the
    ///   tokens are cleared
    /// * `Transient` on network failure, timeout or server error, after
    ///   retrying; the tokens are left unchanged
    /// * `Protocol` on any other unexpected reply; the tokens are left
    ///   unchanged
    pub async fn refresh(&self) -> Result<Arc<TokenSet>> {
        let (_, generation) = self.inner.snapshot()?;
        self.refresh_single_flight(generation).await
    }

    /// Handles an API call rejected because `rejected_access_token` expired.
    ///
    /// Refreshes unless the tokens were already replaced since, in which
    /// case the current ones are returned.
    ///
    /// # Errors
    ///
    /// See [`refresh`](Self::refresh).
    pub async fn refresh_rejected(&self, rejected_access_token: &str) -> Result<Arc<TokenSet>> {
        let (tokens, generation) = self.inner.snapshot()?;
        match tokens {
            None => Err(Error::not_authenticated("no tokens; log in first")),
            Some(tokens)
                if tokens.access_token != rejected_access_token
                    && !tokens.expires_within(self.inner.config.expiry_margin) =>
            {
                trace!("rejected token already replaced");
                Ok(tokens)
            }
            Some(_) => self.refresh_single_flight(generation).await,
        }
    }

    /// Makes previously persisted tokens current.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the session state is poisoned.
    pub fn resume(&self, tokens: TokenSet) -> Result<()> {
        self.inner.install(Some(Arc::new(tokens)))
    }

    /// Resumes a session from a persisted refresh token alone.
    ///
    /// # Errors
    ///
    /// See [`refresh`](Self::refresh).
    pub async fn resume_from_refresh_token(
        &self,
        refresh_token: impl Into<String>,
    ) -> Result<Arc<TokenSet>> {
        let tokens = TokenSet::from_refresh_token(refresh_token.into(), &self.inner.config.scope);
        self.resume(tokens)?;
        self.refresh().await
    }

    /// Forgets the current tokens.
    ///
    /// The service has no logout endpoint, so the tokens stay valid
    /// server-side until they expire.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the session state is poisoned.
    pub fn sign_out(&self) -> Result<()> {
        info!("signing out");
        self.inner.install(None)
    }

    /// The current tokens, fresh or not.
    #[must_use]
    pub fn token_set(&self) -> Option<Arc<TokenSet>> {
        self.inner.snapshot().ok().and_then(|(tokens, _)| tokens)
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token_set().is_some()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    /// The rate-limited HTTP client shared by token and API requests.
    #[must_use]
    pub fn http_client(&self) -> &Arc<HttpClient> {
        &self.inner.http_client
    }

    async fn refresh_single_flight(&self, observed_generation: u64) -> Result<Arc<TokenSet>> {
        let guard = Arc::clone(&self.inner.refresh_lock).lock_owned().await;

        if let Some(outcome) = self.inner.outcome_since(observed_generation)? {
            debug!("sharing outcome of concurrent refresh");
            return outcome.map_err(|(kind, message)| Error::new(kind, message));
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _guard = guard;
            inner.refresh_with_retries().await
        });

        task.await?
    }
}

impl Inner {
    fn snapshot(&self) -> Result<(Option<Arc<TokenSet>>, u64)> {
        let state = self.state.lock()?;
        Ok((state.tokens.clone(), state.generation))
    }

    /// The outcome of whatever replaced the tokens after
    /// `observed_generation`, if anything did.
    fn outcome_since(&self, observed_generation: u64) -> Result<Option<RefreshOutcome>> {
        let state = self.state.lock()?;
        if state.generation == observed_generation {
            return Ok(None);
        }
        Ok(state.last_refresh.clone())
    }

    fn install(&self, tokens: Option<Arc<TokenSet>>) -> Result<()> {
        let mut state = self.state.lock()?;
        state.generation = state.generation.wrapping_add(1);
        state.last_refresh = tokens.clone().map(Ok);
        state.tokens = tokens;
        Ok(())
    }

    fn record(&self, outcome: &Result<Arc<TokenSet>>) -> Result<()> {
        let mut state = self.state.lock()?;
        state.generation = state.generation.wrapping_add(1);
        state.last_refresh = Some(match outcome {
            Ok(tokens) => Ok(Arc::clone(tokens)),
            Err(e) => Err((e.kind, e.error.to_string())),
        });
        Ok(())
    }

    /// Clears the tokens if they are still `expected`.
    fn clear(&self, expected: &Arc<TokenSet>) -> Result<()> {
        let mut state = self.state.lock()?;
        if state
            .tokens
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, expected))
        {
            state.tokens = None;
        }
        Ok(())
    }

    async fn refresh_with_retries(&self) -> Result<Arc<TokenSet>> {
        let backoff = Backoff::new(
            self.config.max_refresh_retries.saturating_add(1),
            self.config.retry_min_delay,
            self.config.retry_max_delay,
        );

        let mut outcome = Err(Error::internal("refresh not attempted"));
        for delay in &backoff {
            outcome = self.refresh_once().await;
            match (&outcome, delay) {
                (Err(e), Some(delay)) if e.is_retryable() => {
                    warn!(
                        "refresh failed, retrying in {:.1}s: {e}",
                        delay.as_secs_f32()
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => break,
            }
        }

        self.record(&outcome)?;
        outcome
    }

    async fn refresh_once(&self) -> Result<Arc<TokenSet>> {
        let (current, _) = self.snapshot()?;
        let current = current.ok_or_else(|| Error::not_authenticated("no refresh token"))?;

        let params = [
            ("client_id", self.identity.client_id()),
            ("refresh_token", current.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
            ("scope", self.config.scope.as_str()),
        ];

        let issued_at = SystemTime::now();
        let request = self
            .http_client
            .post_form(self.config.token_url.clone(), &params);
        let response = self.http_client.execute(request).await?;

        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            let response: TokenResponse = protocol::json(&body, "refresh")?;
            let tokens = Arc::new(TokenSet::from_response(
                response,
                issued_at,
                Some(&current),
                &self.config.scope,
            )?);
            self.install(Some(Arc::clone(&tokens)))?;

            debug!(
                "access token refreshed, expires in {}s",
                tokens.time_to_live().as_secs()
            );
            return Ok(tokens);
        }

        let error = ErrorBody::parse(status, &body);
        match status.as_u16() {
            400 | 401 | 403 => {
                warn!("refresh token rejected: {error}");
                self.clear(&current)?;
                Err(Error::reauthentication_required(error))
            }
            429 | 500..=599 => Err(Error::transient(error)),
            _ => {
                error!("unexpected refresh reply: {error}");
                Err(Error::protocol(error))
            }
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("identity", &self.inner.identity)
            .field("tokens", &self.token_set())
            .finish_non_exhaustive()
    }
}
