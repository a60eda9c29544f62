use crate::common::config::BackendConfig;
use crate::common::{AttendanceError, Result};
use crate::service::protocol::{
    ErrorBody, LoginRequest, LoginResponse, ProfileUpdate, RefreshRequest, RefreshResponse, UserProfile,
};
use crate::session::{Session, TokenPair};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

trait WithAuth {
    fn with_auth(self, access: Option<String>) -> Self;
}

impl WithAuth for RequestBuilder {
    fn with_auth(self, access: Option<String>) -> Self {
        match access {
            Some(token) => self.bearer_auth(token),
            None => self,
        }
    }
}

/// Outbound adapter for the attendance backend.
///
/// Every request carries the session's bearer token. A 401 triggers exactly one
/// refresh-and-retry per original request; if the refresh fails or the retried
/// request is rejected again, the session is expired (tokens cleared, login required).
pub struct ApiClient {
    http: Client,
    base_url: String,
    session: Arc<Session>,
}

impl ApiClient {
    pub fn new(config: &BackendConfig, session: Arc<Session>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends an authenticated request built by `build`.
    ///
    /// `build` is invoked once per attempt because multipart bodies cannot be cloned.
    pub(crate) async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let response = self.dispatch(&build).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!("Request unauthorized, attempting token refresh");
        let Some(refresh) = self.session.refresh_token() else {
            self.session.expire();
            return Err(AttendanceError::SessionExpired);
        };

        if let Err(e) = self.refresh_access(&refresh).await {
            tracing::warn!("Token refresh failed: {}", e);
            self.session.expire();
            return Err(AttendanceError::SessionExpired);
        }

        let retried = self.dispatch(&build).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            // Already refreshed once for this request; do not loop.
            self.session.expire();
            return Err(AttendanceError::SessionExpired);
        }
        Ok(retried)
    }

    async fn dispatch<F>(&self, build: &F) -> Result<Response>
    where
        F: Fn(&Client) -> Result<RequestBuilder>,
    {
        let request = build(&self.http)?.with_auth(self.session.access_token());
        Ok(request.send().await?)
    }

    async fn refresh_access(&self, refresh: &str) -> Result<()> {
        let response = self.http
            .post(self.url("/auth/token/refresh/"))
            .json(&RefreshRequest { refresh: refresh.to_string() })
            .send()
            .await?;

        let body: RefreshResponse = decode(response).await?;
        self.session.rotate_access(body.access)?;
        tracing::debug!("Access token refreshed");
        Ok(())
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.get(&url))).await?;
        decode(response).await
    }

    pub(crate) async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.post(&url))).await?;
        decode(response).await
    }

    pub(crate) async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url(path);
        let response = self.send(|http| Ok(http.get(&url))).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    // Auth

    pub async fn login(&self, username: &str, password: &str) -> Result<UserProfile> {
        let response = self.http
            .post(self.url("/auth/login/"))
            .json(&LoginRequest { username: username.to_string(), password: password.to_string() })
            .send()
            .await?;

        let login: LoginResponse = decode(response).await?;
        let tokens = TokenPair { access: login.access, refresh: login.refresh };
        self.session.establish(tokens, login.user.clone())?;
        tracing::info!("Logged in as {} ({})", login.user.username, login.user.role);
        Ok(login.user)
    }

    /// Blacklists the refresh token server-side when possible; local tokens are cleared regardless.
    pub async fn logout(&self) -> Result<()> {
        if let Some(refresh) = self.session.refresh_token() {
            let url = self.url("/auth/logout/");
            let body = RefreshRequest { refresh };
            match self.dispatch(&|http: &Client| Ok(http.post(&url).json(&body))).await {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::debug!("Logout returned {}", resp.status());
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Logout request failed: {}", e),
            }
        }
        self.session.clear()
    }

    pub async fn profile(&self) -> Result<UserProfile> {
        let user: UserProfile = self.get_json("/auth/profile/").await?;
        self.session.update_user(user.clone())?;
        Ok(user)
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile> {
        let url = self.url("/auth/profile/update/");
        let response = self.send(|http| Ok(http.put(&url).json(update))).await?;
        let user: UserProfile = decode(response).await?;
        self.session.update_user(user.clone())?;
        Ok(user)
    }
}

pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(api_error(response).await);
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) async fn api_error(response: Response) -> AttendanceError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.best_message())
        .unwrap_or_else(|| format!("Request failed with status {}", status.as_u16()));

    AttendanceError::Api { status: status.as_u16(), message }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! In-process stand-in for the attendance backend.

    use axum::Router;
    use std::net::SocketAddr;

    pub async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/api", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::test_server;
    use super::*;
    use crate::session::{MemoryTokenStore, SessionStatus};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        refreshes: AtomicUsize,
        profile_hits: AtomicUsize,
    }

    fn bearer(headers: &HeaderMap) -> Option<String> {
        headers.get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    }

    fn profile_json() -> serde_json::Value {
        json!({"id": 1, "username": "admin", "first_name": "Ada", "last_name": "Admin", "role": "admin"})
    }

    async fn client_for(app: Router, tokens: Option<TokenPair>) -> ApiClient {
        let base_url = test_server::spawn(app).await;
        let store = match tokens {
            Some(t) => MemoryTokenStore::with_tokens(t),
            None => MemoryTokenStore::new(),
        };
        let session = Arc::new(Session::init(Box::new(store)).unwrap());
        let config = BackendConfig { base_url, timeout_seconds: 5 };
        ApiClient::new(&config, session).unwrap()
    }

    fn stale_tokens() -> TokenPair {
        TokenPair { access: "stale".into(), refresh: "refresh-ok".into() }
    }

    /// Accepts only the access token issued by the refresh endpoint.
    fn rotating_backend(counters: Arc<Counters>, refresh_works: bool) -> Router {
        Router::new()
            .route("/api/auth/token/refresh/", post(move |State(c): State<Arc<Counters>>| async move {
                c.refreshes.fetch_add(1, Ordering::SeqCst);
                if refresh_works {
                    (AxumStatus::OK, Json(json!({"access": "fresh"})))
                } else {
                    (AxumStatus::UNAUTHORIZED, Json(json!({"detail": "Token is invalid or expired"})))
                }
            }))
            .route("/api/auth/profile/", get(|State(c): State<Arc<Counters>>, headers: HeaderMap| async move {
                c.profile_hits.fetch_add(1, Ordering::SeqCst);
                if bearer(&headers).as_deref() == Some("fresh") {
                    (AxumStatus::OK, Json(profile_json()))
                } else {
                    (AxumStatus::UNAUTHORIZED, Json(json!({"detail": "Given token not valid"})))
                }
            }))
            .with_state(counters)
    }

    #[tokio::test]
    async fn expired_access_is_refreshed_once_and_retried() {
        let counters = Arc::new(Counters::default());
        let client = client_for(rotating_backend(counters.clone(), true), Some(stale_tokens())).await;

        let user = client.profile().await.unwrap();
        assert_eq!(user.username, "admin");
        assert_eq!(counters.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.profile_hits.load(Ordering::SeqCst), 2);
        assert_eq!(client.session().access_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn second_unauthorized_clears_tokens_without_another_refresh() {
        let counters = Arc::new(Counters::default());
        let app = Router::new()
            .route("/api/auth/token/refresh/", post(|State(c): State<Arc<Counters>>| async move {
                c.refreshes.fetch_add(1, Ordering::SeqCst);
                Json(json!({"access": "still-rejected"}))
            }))
            .route("/api/auth/profile/", get(|State(c): State<Arc<Counters>>| async move {
                c.profile_hits.fetch_add(1, Ordering::SeqCst);
                (AxumStatus::UNAUTHORIZED, Json(json!({"detail": "nope"})))
            }))
            .with_state(counters.clone());
        let client = client_for(app, Some(stale_tokens())).await;

        let err = client.profile().await.unwrap_err();
        assert!(matches!(err, AttendanceError::SessionExpired));
        assert_eq!(counters.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.profile_hits.load(Ordering::SeqCst), 2);
        assert!(client.session().access_token().is_none());
        assert_eq!(client.session().status(), SessionStatus::LoginRequired);
    }

    #[tokio::test]
    async fn failed_refresh_forces_login() {
        let counters = Arc::new(Counters::default());
        let client = client_for(rotating_backend(counters.clone(), false), Some(stale_tokens())).await;

        let err = client.profile().await.unwrap_err();
        assert!(matches!(err, AttendanceError::SessionExpired));
        assert_eq!(counters.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.profile_hits.load(Ordering::SeqCst), 1);
        assert_eq!(client.session().status(), SessionStatus::LoginRequired);
    }

    #[tokio::test]
    async fn login_establishes_session_and_logout_clears_it() {
        let app = Router::new()
            .route("/api/auth/login/", post(|Json(body): Json<serde_json::Value>| async move {
                if body["password"] == "secret" {
                    (AxumStatus::OK, Json(json!({"access": "a", "refresh": "r", "user": profile_json()})))
                } else {
                    (AxumStatus::BAD_REQUEST, Json(json!({"non_field_errors": ["bad"], "error": "Invalid credentials"})))
                }
            }))
            .route("/api/auth/logout/", post(|| async { Json(json!({"message": "ok"})) }));
        let client = client_for(app, None).await;

        let err = client.login("admin", "wrong").await.unwrap_err();
        assert_eq!(err.user_message(), "Invalid credentials");
        assert!(!client.session().is_authenticated());

        let user = client.login("admin", "secret").await.unwrap();
        assert_eq!(user.display_name(), "Ada Admin");
        assert_eq!(client.session().refresh_token().as_deref(), Some("r"));

        client.logout().await.unwrap();
        assert_eq!(client.session().status(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn non_json_errors_fall_back_to_status_text() {
        let app = Router::new()
            .route("/api/attendance/face/model/status/", get(|| async { (AxumStatus::BAD_GATEWAY, "upstream down") }));
        let client = client_for(app, Some(stale_tokens())).await;

        let err = client.get_json::<serde_json::Value>("/attendance/face/model/status/").await.unwrap_err();
        match err {
            AttendanceError::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "Request failed with status 502");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
