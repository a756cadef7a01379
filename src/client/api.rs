use async_trait::async_trait;
use reqwest::{header, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::auth::SESSION_COOKIE;
use crate::protocol::*;

pub type ClientResult<T> = Result<T, ClientError>;

/// Errors seen from the client side of the API
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The server answered with an error body
    #[error("{code} ({status}): {msg}")]
    Api { status: u16, code: String, msg: String },

    #[error("Change feed failed: {0}")]
    Feed(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// The server no longer recognises us; stored identity is stale
    pub fn is_unauthorized(&self) -> bool {
        self.code() == Some("UNAUTHORIZED")
    }
}

/// The reads a reconciliation loop needs
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Server-verified identity for the stored session cookie
    async fn me(&self) -> ClientResult<Identity>;

    /// The caller's view of a session
    async fn view(&self, session_id: &str) -> ClientResult<SessionView>;
}

/// HTTP client for the game API.
///
/// Keeps the session cookie the server hands out and replays it on every
/// request, so a re-issued or cleared cookie takes effect immediately.
pub struct HttpSessionApi {
    base_url: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ClientError::InvalidUrl(base_url));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url,
            client,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resume with a token kept from an earlier run
    pub async fn set_token(&self, token: Option<String>) {
        *self.token.write().await = token;
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Cookie header value for the stored session, if any
    pub async fn cookie_header(&self) -> Option<String> {
        self.token()
            .await
            .map(|token| format!("{SESSION_COOKIE}={token}"))
    }

    async fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(cookie) = self.cookie_header().await {
            builder = builder.header(header::COOKIE, cookie);
        }
        builder
    }

    /// Pick up a Set-Cookie for our session; an empty value clears it
    fn session_cookie(response: &Response) -> Option<Option<String>> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|value| value.split(';').next()?.split_once('='))
            .filter(|(name, _)| name.trim() == SESSION_COOKIE)
            .map(|(_, token)| {
                let token = token.trim();
                (!token.is_empty()).then(|| token.to_string())
            })
            .last()
    }

    async fn dispatch(&self, builder: RequestBuilder) -> ClientResult<Response> {
        let response = builder.send().await?;
        if let Some(token) = Self::session_cookie(&response) {
            *self.token.write().await = token;
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(err) => ClientError::Api {
                status: status.as_u16(),
                code: err.code,
                msg: err.msg,
            },
            Err(_) => ClientError::Api {
                status: status.as_u16(),
                code: "HTTP_ERROR".to_string(),
                msg: body,
            },
        };
        tracing::debug!("API request failed: {}", err);
        Err(err)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let builder = self.request(Method::GET, path).await;
        Ok(self.dispatch(builder).await?.json().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> ClientResult<T> {
        let builder = self.request(Method::POST, path).await.json(body);
        Ok(self.dispatch(builder).await?.json().await?)
    }

    async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let builder = self.request(Method::POST, path).await;
        Ok(self.dispatch(builder).await?.json().await?)
    }

    pub async fn create_session(&self, req: &CreateSessionRequest) -> ClientResult<Identity> {
        self.post("/api/sessions", req).await
    }

    pub async fn join_session(&self, req: &JoinSessionRequest) -> ClientResult<Identity> {
        self.post("/api/sessions/join", req).await
    }

    pub async fn list_sessions(&self) -> ClientResult<Vec<SessionSummary>> {
        self.get("/api/sessions").await
    }

    pub async fn categories(&self) -> ClientResult<Vec<String>> {
        self.get("/api/categories").await
    }

    pub async fn set_ready(&self, session_id: &str, ready: bool) -> ClientResult<SessionView> {
        self.post(&format!("/api/sessions/{session_id}/ready"), &ReadyRequest { ready })
            .await
    }

    pub async fn leave(&self, session_id: &str) -> ClientResult<()> {
        let builder = self
            .request(Method::POST, &format!("/api/sessions/{session_id}/leave"))
            .await;
        self.dispatch(builder).await?;
        Ok(())
    }

    pub async fn kick(&self, session_id: &str, player_id: &str) -> ClientResult<SessionView> {
        let req = KickRequest {
            player_id: player_id.to_string(),
        };
        self.post(&format!("/api/sessions/{session_id}/kick"), &req)
            .await
    }

    pub async fn start_game(&self, session_id: &str) -> ClientResult<SessionView> {
        self.post_empty(&format!("/api/sessions/{session_id}/start"))
            .await
    }

    pub async fn select_category(&self, session_id: &str, category: &str) -> ClientResult<SessionView> {
        let req = CategoryRequest {
            category: category.to_string(),
        };
        self.post(&format!("/api/sessions/{session_id}/category"), &req)
            .await
    }

    pub async fn submit(&self, session_id: &str, req: &SubmitRequest) -> ClientResult<SessionView> {
        self.post(&format!("/api/sessions/{session_id}/submit"), req)
            .await
    }

    pub async fn select_winner(&self, session_id: &str, text: &str) -> ClientResult<SessionView> {
        let req = WinnerRequest {
            text: text.to_string(),
        };
        self.post(&format!("/api/sessions/{session_id}/winner"), &req)
            .await
    }

    pub async fn resolve_approval(&self, session_id: &str, approve: bool) -> ClientResult<SessionView> {
        self.post(
            &format!("/api/sessions/{session_id}/approval"),
            &ApprovalRequest { approve },
        )
        .await
    }

    pub async fn advance_round(&self, session_id: &str) -> ClientResult<SessionView> {
        self.post_empty(&format!("/api/sessions/{session_id}/advance"))
            .await
    }

    pub async fn reset_game(&self, session_id: &str) -> ClientResult<SessionView> {
        self.post_empty(&format!("/api/sessions/{session_id}/reset"))
            .await
    }

    /// Change-feed URL for a session
    pub fn feed_url(&self, session_id: &str) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else {
            let rest = self.base_url.strip_prefix("http://").unwrap_or(&self.base_url);
            format!("ws://{rest}")
        };
        format!("{ws_base}/ws?session_id={session_id}")
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn me(&self) -> ClientResult<Identity> {
        self.get("/api/me").await
    }

    async fn view(&self, session_id: &str) -> ClientResult<SessionView> {
        self.get(&format!("/api/sessions/{session_id}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_urls() {
        assert!(matches!(
            HttpSessionApi::new("ftp://example.com"),
            Err(ClientError::InvalidUrl(_))
        ));
        let api = HttpSessionApi::new("http://localhost:3000/").unwrap();
        assert_eq!(api.base_url(), "http://localhost:3000");
    }

    #[test]
    fn test_feed_url() {
        let api = HttpSessionApi::new("http://localhost:3000").unwrap();
        assert_eq!(api.feed_url("s1"), "ws://localhost:3000/ws?session_id=s1");

        let api = HttpSessionApi::new("https://cards.example.com").unwrap();
        assert_eq!(
            api.feed_url("s1"),
            "wss://cards.example.com/ws?session_id=s1"
        );
    }

    #[tokio::test]
    async fn test_cookie_header() {
        let api = HttpSessionApi::new("http://localhost:3000").unwrap();
        assert!(api.cookie_header().await.is_none());
        api.set_token(Some("abc".into())).await;
        assert_eq!(
            api.cookie_header().await.as_deref(),
            Some("partycards_session=abc")
        );
    }

    #[test]
    fn test_unauthorized_detection() {
        let err = ClientError::Api {
            status: 401,
            code: "UNAUTHORIZED".into(),
            msg: "not_a_member".into(),
        };
        assert!(err.is_unauthorized());
        let err = ClientError::InvalidUrl("x".into());
        assert!(!err.is_unauthorized());
        assert!(err.code().is_none());
    }
}
