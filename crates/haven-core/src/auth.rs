use std::future::Future;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::errors::HavenError;

static ROOM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("room id pattern"));

/// Supplies the short-lived bearer token the chat socket authenticates with.
pub trait TokenProvider: Send + Sync {
    fn fetch_token(&self) -> impl Future<Output = Result<String, HavenError>> + Send;
}

/// A token handed over by the embedding app.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    async fn fetch_token(&self) -> Result<String, HavenError> {
        if self.0.is_empty() {
            return Err(HavenError::Auth("no token configured".into()));
        }
        Ok(self.0.clone())
    }
}

/// Response body of the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Fetches tokens from an HTTP endpoint answering `{"token": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
    user_id: Option<String>,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            user_id: None,
        }
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn request_url(&self) -> String {
        match &self.user_id {
            Some(user) => {
                let sep = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{sep}userId={}", self.endpoint, urlencoding::encode(user))
            }
            None => self.endpoint.clone(),
        }
    }
}

impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<String, HavenError> {
        let url = self.request_url();
        tracing::info!("requesting socket token from {}", self.endpoint);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| HavenError::Http(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(HavenError::Auth(format!("token endpoint returned {status}")));
        }
        if !status.is_success() {
            return Err(HavenError::Http(format!("token endpoint returned {status}")));
        }

        let data: TokenResponse = resp
            .json()
            .await
            .map_err(|e| HavenError::Auth(format!("invalid token response: {e}")))?;
        if data.token.is_empty() {
            return Err(HavenError::Auth("token endpoint returned an empty token".into()));
        }
        Ok(data.token)
    }
}

/// Check that `room_id` is safe to splice into a socket URL.
pub fn validate_room_id(room_id: &str) -> Result<(), HavenError> {
    if ROOM_ID.is_match(room_id) {
        Ok(())
    } else {
        Err(HavenError::InvalidRoom(format!("invalid room id: '{room_id}'")))
    }
}

/// `<server>/<room_id>?token=<token>`
pub fn socket_url(server: &Url, room_id: &str, token: &str) -> Result<Url, HavenError> {
    validate_room_id(room_id)?;
    if token.is_empty() {
        return Err(HavenError::Auth("missing token".into()));
    }

    let mut url = server.clone();
    url.path_segments_mut()
        .map_err(|_| HavenError::Config(format!("server url cannot take a path: {server}")))?
        .pop_if_empty()
        .push(room_id);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}
