//! Authorized requests to the TIDAL REST API.
//!
//! Implements the caller side of the re-authentication contract with the
//! [`SessionManager`]: every request carries a token from
//! [`valid_token`](SessionManager::valid_token), and a `401` with
//! `subStatus` 11003 is answered by forcing a refresh and retrying exactly
//! once. Requests go through the session's HTTP client, so API and token
//! requests share one rate limit.
//!
//! Responses are returned as deserialized JSON of the caller's choosing;
//! this module does not model catalog data.
//!
//! # Example
//!
//! ```rust
//! let api = api::Client::new(session.clone());
//! let track: serde_json::Value = api.get("tracks/79580198", &[]).await?;
//! let _: serde_json::Value = api
//!     .post("users/42/favorites/tracks", &[], &[("trackIds", "79580198")])
//!     .await?;
//! ```

use std::{fmt::Debug, sync::Arc};

use reqwest::{
    header::{HeaderName, HeaderValue, AUTHORIZATION},
    Method,
};
use serde::Deserialize;
use url::Url;

use crate::{
    error::{Error, Result},
    http::Client as HttpClient,
    protocol::{self, status::ErrorBody},
    session::SessionManager,
    tokens::TokenSet,
};

/// Header carrying the client id on API requests.
const TIDAL_TOKEN: HeaderName = HeaderName::from_static("x-tidal-token");

/// Query parameter most catalog endpoints require.
const COUNTRY_CODE: &str = "countryCode";

pub struct Client {
    session: SessionManager,
    http_client: Arc<HttpClient>,
}

/// What came back from a single attempt.
enum Reply {
    Body(Vec<u8>),
    Expired(ErrorBody),
}

impl Client {
    /// Creates an API client that takes its tokens and HTTP client from
    /// `session`.
    #[must_use]
    pub fn new(session: SessionManager) -> Self {
        let http_client = Arc::clone(session.http_client());
        Self {
            session,
            http_client,
        }
    }

    /// Sends an authorized GET to `path` relative to the API base URL.
    ///
    /// The account's `countryCode` is added to the query unless `query`
    /// already has one.
    ///
    /// # Errors
    ///
    /// * Any error of [`SessionManager::valid_token`]
    /// * `Transient` on network failure, rate limiting or server error
    /// * `Api` if the request is rejected, or the token is still reported
    ///   expired after one refresh
    /// * `Protocol` if the response does not deserialize into `T`
    pub async fn get<T>(&self, path: &str, query: &[(&str, &str)]) -> Result<T>
    where
        T: for<'de> Deserialize<'de> + Debug,
    {
        self.request(Method::GET, path, query, &[]).await
    }

    /// Sends an authorized, form-encoded POST to `path` relative to the API
    /// base URL.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get).
    pub async fn post<T>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        form: &[(&str, &str)],
    ) -> Result<T>
    where
        T: for<'de> Deserialize<'de> + Debug,
    {
        self.request(Method::POST, path, query, form).await
    }

    async fn request<T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        form: &[(&str, &str)],
    ) -> Result<T>
    where
        T: for<'de> Deserialize<'de> + Debug,
    {
        let tokens = self.session.valid_token().await?;
        let error = match self.send(&method, path, query, form, &tokens).await? {
            Reply::Body(body) => return protocol::json(&body, path),
            Reply::Expired(error) => error,
        };

        debug!("{method} {path}: {error}; refreshing and retrying once");
        let tokens = self.session.refresh_rejected(&tokens.access_token).await?;
        match self.send(&method, path, query, form, &tokens).await? {
            Reply::Body(body) => protocol::json(&body, path),
            Reply::Expired(error) => Err(Error::api(error)),
        }
    }

    fn url(&self, path: &str, query: &[(&str, &str)], tokens: &TokenSet) -> Result<Url> {
        let mut url = self
            .session
            .config()
            .api_base_url
            .join(path.trim_start_matches('/'))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.extend_pairs(query);
            if let Some(ref country_code) = tokens.country_code {
                if !query.iter().any(|(key, _)| *key == COUNTRY_CODE) {
                    pairs.append_pair(COUNTRY_CODE, country_code);
                }
            }
        }

        Ok(url)
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, &str)],
        form: &[(&str, &str)],
        tokens: &TokenSet,
    ) -> Result<Reply> {
        let url = self.url(path, query, tokens)?;
        let mut request = if *method == Method::POST {
            self.http_client.post_form(url, form)
        } else {
            self.http_client.get(url)
        };
        *request.method_mut() = method.clone();

        let headers = request.headers_mut();
        headers.try_insert(AUTHORIZATION, HeaderValue::from_str(&tokens.authorization())?)?;
        headers.try_insert(
            TIDAL_TOKEN,
            HeaderValue::from_str(self.session.identity().client_id())?,
        )?;

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            return Ok(Reply::Body(body.to_vec()));
        }

        let error = ErrorBody::parse(status, &body);
        if error.is_expired_token() {
            return Ok(Reply::Expired(error));
        }

        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::transient(error));
        }

        Err(Error::api(error))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use serde_json::json;
    use wiremock::{
        matchers::{body_string_contains, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{config::Config, error::ErrorKind, identity::ClientIdentity};

    async fn client(server: &MockServer) -> Client {
        let base = Url::parse(&server.uri()).unwrap();
        let mut config = Config::new().with_base_url(&base).unwrap();
        config.retry_min_delay = Duration::from_millis(10);

        let identity = ClientIdentity::new("test_client", "0123456789abcdef").unwrap();
        let session = SessionManager::new(config, identity).unwrap();

        let mut tokens = TokenSet::from_refresh_token("rt1".to_owned(), "r_usr w_usr w_sub");
        tokens.access_token = "at1".to_owned();
        tokens.expires_at = SystemTime::now() + Duration::from_secs(3600);
        tokens.country_code = Some("NL".to_owned());
        session.resume(tokens).unwrap();

        Client::new(session)
    }

    fn expired_token() -> ResponseTemplate {
        ResponseTemplate::new(401).set_body_json(json!({
            "status": 401,
            "subStatus": 11003,
            "userMessage": "The token has expired."
        }))
    }

    async fn mount_refresh(server: &MockServer, expected: u64) {
        Mock::given(method("POST"))
            .and(path("/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "at2",
                "expires_in": 3600
            })))
            .expect(expected)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn sends_token_client_id_and_country() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/tracks/1"))
            .and(header("authorization", "Bearer at1"))
            .and(header("x-tidal-token", "test_client"))
            .and(query_param("countryCode", "NL"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(&server, 0).await;

        let api = client(&server).await;
        let track: serde_json::Value = api.get("/tracks/1", &[]).await.unwrap();
        assert_eq!(track["id"], 1);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/tracks/1"))
            .and(header("authorization", "Bearer at1"))
            .respond_with(expired_token())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/tracks/1"))
            .and(header("authorization", "Bearer at2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(&server, 1).await;

        let api = client(&server).await;
        let track: serde_json::Value = api.get("tracks/1", &[]).await.unwrap();
        assert_eq!(track["id"], 1);
    }

    #[tokio::test]
    async fn second_expiry_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/tracks/1"))
            .respond_with(expired_token())
            .expect(2)
            .mount(&server)
            .await;
        mount_refresh(&server, 1).await;

        let api = client(&server).await;
        let err = api.get::<serde_json::Value>("tracks/1", &[]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
    }

    #[tokio::test]
    async fn other_rejections_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/tracks/0"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "status": 404,
                "subStatus": 2001,
                "userMessage": "Track not found"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(&server, 0).await;

        let api = client(&server).await;
        let err = api.get::<serde_json::Value>("tracks/0", &[]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Api);
        assert_eq!(err.downcast::<ErrorBody>().unwrap().sub_status, Some(2001));
    }

    #[tokio::test]
    async fn post_is_refreshed_and_retried_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/users/42/favorites/tracks"))
            .and(header("authorization", "Bearer at1"))
            .respond_with(expired_token())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/users/42/favorites/tracks"))
            .and(header("authorization", "Bearer at2"))
            .and(query_param("countryCode", "NL"))
            .and(body_string_contains("trackIds=1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        mount_refresh(&server, 1).await;

        let api = client(&server).await;
        let _: serde_json::Value = api
            .post("users/42/favorites/tracks", &[], &[("trackIds", "1")])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shares_the_session_http_client() {
        let server = MockServer::start().await;
        let api = client(&server).await;
        assert!(Arc::ptr_eq(&api.http_client, api.session.http_client()));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/tracks/1"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server).await;
        let err = api.get::<serde_json::Value>("tracks/1", &[]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
