//! HTTP API endpoints.
//!
//! Every handler is thin: pull the session cookie, authorize, call into
//! [`AppState`], and answer with the caller's refreshed view. The cookie is
//! re-issued whenever the caller's live role no longer matches the one baked
//! into their token.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::auth::{clear_cookie, session_cookie, token_from_headers, Actor};
use crate::error::{GameError, GameResult};
use crate::protocol::*;
use crate::state::{AppState, Joined};
use crate::ws;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/join", post(join_session))
        .route("/api/me", get(me))
        .route("/api/categories", get(categories))
        .route("/api/sessions/{id}", get(session_view))
        .route("/api/sessions/{id}/ready", post(set_ready))
        .route("/api/sessions/{id}/leave", post(leave))
        .route("/api/sessions/{id}/kick", post(kick))
        .route("/api/sessions/{id}/start", post(start_game))
        .route("/api/sessions/{id}/category", post(select_category))
        .route("/api/sessions/{id}/submit", post(submit_response))
        .route("/api/sessions/{id}/winner", post(select_winner))
        .route("/api/sessions/{id}/approval", post(resolve_approval))
        .route("/api/sessions/{id}/advance", post(advance_round))
        .route("/api/sessions/{id}/reset", post(reset_game))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// JSON body plus an optional Set-Cookie
fn with_cookie<T: Serialize>(status: StatusCode, cookie: Option<String>, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

fn reissue(state: &AppState, actor: &Actor) -> GameResult<Option<String>> {
    if !actor.needs_reissue() {
        return Ok(None);
    }
    tracing::debug!(player_id = %actor.player_id, role = ?actor.role, "Re-issuing session cookie");
    let token = state.token_for(actor)?;
    Ok(Some(session_cookie(&state.auth, &token)))
}

fn entered(state: &AppState, status: StatusCode, joined: Joined) -> Response {
    let identity = Identity {
        player_id: joined.player.id,
        session_id: joined.session.id,
        room_code: joined.session.room_code,
        name: joined.player.name,
        avatar: joined.player.avatar,
        role: joined.role,
    };
    with_cookie(
        status,
        Some(session_cookie(&state.auth, &joined.token)),
        identity,
    )
}

/// Answer a successful mutation with the caller's view of the session
async fn refreshed(state: &AppState, session_id: &str, headers: &HeaderMap) -> GameResult<Response> {
    let token = token_from_headers(headers);
    match state.authorize(token.as_deref(), session_id).await {
        Ok(actor) => {
            let view = state.view(session_id, Some(&actor)).await?;
            Ok(with_cookie(StatusCode::OK, reissue(state, &actor)?, view))
        }
        // The operation itself ended the caller's membership (full reset)
        Err(GameError::Unauthorized(_)) => {
            let view = state.view(session_id, None).await?;
            Ok(with_cookie(
                StatusCode::OK,
                Some(clear_cookie(&state.auth)),
                view,
            ))
        }
        Err(e) => Err(e),
    }
}

async fn authorized(state: &AppState, session_id: &str, headers: &HeaderMap) -> GameResult<Actor> {
    let token = token_from_headers(headers);
    state.authorize(token.as_deref(), session_id).await
}

/// POST /api/sessions
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Response, GameError> {
    let joined = state.create_session(req).await?;
    Ok(entered(&state, StatusCode::CREATED, joined))
}

/// GET /api/sessions
async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionSummary>>, GameError> {
    Ok(Json(state.list_public_sessions().await?))
}

/// POST /api/sessions/join
async fn join_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<JoinSessionRequest>,
) -> Result<Response, GameError> {
    let joined = state.join_session(req).await?;
    Ok(entered(&state, StatusCode::OK, joined))
}

/// GET /api/me
///
/// The only identity a client should trust: resolved from the cookie against
/// live rows.
async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Response, GameError> {
    let token = token_from_headers(&headers);
    let (identity, actor) = state.identity(token.as_deref()).await?;
    Ok(with_cookie(StatusCode::OK, reissue(&state, &actor)?, identity))
}

/// GET /api/categories
async fn categories(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, GameError> {
    Ok(Json(state.categories().await?))
}

/// GET /api/sessions/{id}
async fn session_view(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GameError> {
    let token = token_from_headers(&headers);
    let viewer = state.viewer(token.as_deref(), &session_id).await?;
    let view = state.view(&session_id, viewer.as_ref()).await?;
    let cookie = match &viewer {
        Some(actor) => reissue(&state, actor)?,
        None => None,
    };
    Ok(with_cookie(StatusCode::OK, cookie, view))
}

async fn set_ready(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ReadyRequest>,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.set_ready(&actor, &actor.player_id, req.ready).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn leave(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.leave(&actor).await?;
    let mut response = StatusCode::NO_CONTENT.into_response();
    if let Ok(value) = HeaderValue::from_str(&clear_cookie(&state.auth)) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    Ok(response)
}

async fn kick(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<KickRequest>,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.kick(&actor, &req.player_id).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn start_game(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.start_game(&actor).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn select_category(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CategoryRequest>,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.select_category(&actor, &req.category).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn submit_response(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.submit_response(&actor, req).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn select_winner(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<WinnerRequest>,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.select_winner(&actor, &req.text).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn resolve_approval(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ApprovalRequest>,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.resolve_approval(&actor, req.approve).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn advance_round(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.advance_round(&actor).await?;
    refreshed(&state, &session_id, &headers).await
}

async fn reset_game(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, GameError> {
    let actor = authorized(&state, &session_id, &headers).await?;
    state.reset_game(&actor).await?;
    refreshed(&state, &session_id, &headers).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, SESSION_COOKIE};
    use crate::state::testing::{pack, rules};
    use crate::types::{Phase, Role};
    use axum::body::Body;
    use axum::http::Request;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<AppState>) {
        let state = AppState::in_memory(rules(), AuthConfig::new(b"api-test-secret".to_vec()));
        pack(40).seed(state.store.as_ref()).await.unwrap();
        let state = Arc::new(state);
        (router(state.clone()), state)
    }

    fn request(method: &str, uri: &str, cookie: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = cookie {
            builder = builder.header(header::COOKIE, format!("{SESSION_COOKIE}={token}"));
        }
        let body = if body.is_null() {
            Body::empty()
        } else {
            Body::from(body.to_string())
        };
        builder.body(body).unwrap()
    }

    /// Token from a Set-Cookie header, if any
    fn cookie_token(response: &Response) -> Option<String> {
        let value = response.headers().get(header::SET_COOKIE)?.to_str().ok()?;
        let pair = value.split(';').next()?;
        let (_, token) = pair.split_once('=')?;
        Some(token.to_string())
    }

    async fn json<T: DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> Response {
        app.clone().oneshot(req).await.unwrap()
    }

    /// Create a session and join `guests` players; returns (session id, tokens host first)
    async fn seated(app: &Router, guests: usize) -> (String, String, Vec<String>) {
        let response = send(
            app,
            request("POST", "/api/sessions", None, serde_json::json!({"name": "Host"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let token = cookie_token(&response).unwrap();
        let identity: Identity = json(response).await;

        let mut tokens = vec![token];
        for i in 0..guests {
            let response = send(
                app,
                request(
                    "POST",
                    "/api/sessions/join",
                    None,
                    serde_json::json!({"room_code": identity.room_code, "name": format!("Guest {i}")}),
                ),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
            tokens.push(cookie_token(&response).unwrap());
        }
        (identity.session_id, identity.room_code, tokens)
    }

    #[tokio::test]
    async fn test_create_sets_cookie() {
        let (app, _) = app().await;
        let response = send(
            &app,
            request("POST", "/api/sessions", None, serde_json::json!({"name": "Ada"})),
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("partycards_session="));
        assert!(cookie.contains("HttpOnly"));

        let identity: Identity = json(response).await;
        assert_eq!(identity.name, "Ada");
        assert_eq!(identity.role, Role::Host);
    }

    #[tokio::test]
    async fn test_me_requires_cookie() {
        let (app, _) = app().await;
        let response = send(&app, request("GET", "/api/me", None, serde_json::Value::Null)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.code, "UNAUTHORIZED");
        assert_eq!(body.msg, "unauthorized: missing_token");

        let (_, _, tokens) = seated(&app, 1).await;
        let response = send(&app, request("GET", "/api/me", Some(&tokens[1]), serde_json::Value::Null)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let identity: Identity = json(response).await;
        assert_eq!(identity.role, Role::Player);
    }

    #[tokio::test]
    async fn test_start_reissues_cookie_for_new_role() {
        let (app, _) = app().await;
        let (sid, _, tokens) = seated(&app, 2).await;

        for token in &tokens {
            let response = send(
                &app,
                request(
                    "POST",
                    &format!("/api/sessions/{sid}/ready"),
                    Some(token),
                    serde_json::json!({"ready": true}),
                ),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = send(
            &app,
            request(
                "POST",
                &format!("/api/sessions/{sid}/start"),
                Some(&tokens[0]),
                serde_json::Value::Null,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        // Host readied first and now judges
        assert!(cookie_token(&response).is_some());
        let view: SessionView = json(response).await;
        assert_eq!(view.session.phase, Phase::CategorySelection);
        assert_eq!(view.my_role, Role::Judge);
        assert_eq!(view.hand.len(), 3);
    }

    #[tokio::test]
    async fn test_guard_errors_map_to_status() {
        let (app, _) = app().await;
        let (sid, _, tokens) = seated(&app, 2).await;

        let response = send(
            &app,
            request(
                "POST",
                &format!("/api/sessions/{sid}/start"),
                Some(&tokens[1]),
                serde_json::Value::Null,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.code, "NOT_HOST");

        let response = send(
            &app,
            request(
                "POST",
                &format!("/api/sessions/{sid}/category"),
                Some(&tokens[0]),
                serde_json::json!({"category": "Food"}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.code, "NOT_CURRENT_JUDGE");

        let response = send(
            &app,
            request(
                "POST",
                &format!("/api/sessions/{sid}/start"),
                Some(&tokens[0]),
                serde_json::Value::Null,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.code, "NOT_ALL_READY");
    }

    #[tokio::test]
    async fn test_private_sessions_hidden_from_spectators() {
        let (app, _) = app().await;
        let response = send(
            &app,
            request(
                "POST",
                "/api/sessions",
                None,
                serde_json::json!({"name": "Secret", "visibility": "private"}),
            ),
        )
        .await;
        let identity: Identity = json(response).await;
        let (public_sid, _, _) = seated(&app, 0).await;

        let response = send(
            &app,
            request("GET", &format!("/api/sessions/{}", identity.session_id), None, serde_json::Value::Null),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = send(
            &app,
            request("GET", &format!("/api/sessions/{public_sid}"), None, serde_json::Value::Null),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let view: SessionView = json(response).await;
        assert_eq!(view.my_role, Role::Spectator);
        assert!(view.me.is_none());

        let response = send(&app, request("GET", "/api/sessions", None, serde_json::Value::Null)).await;
        let listed: Vec<SessionSummary> = json(response).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, public_sid);
    }

    #[tokio::test]
    async fn test_leave_clears_cookie() {
        let (app, state) = app().await;
        let (sid, _, tokens) = seated(&app, 1).await;

        let response = send(
            &app,
            request(
                "POST",
                &format!("/api/sessions/{sid}/leave"),
                Some(&tokens[1]),
                serde_json::Value::Null,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.contains("Max-Age=0"));
        assert_eq!(state.roster(&sid).await.unwrap().len(), 1);

        let response = send(&app, request("GET", "/api/me", Some(&tokens[1]), serde_json::Value::Null)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_categories_listed() {
        let (app, _) = app().await;
        let response = send(&app, request("GET", "/api/categories", None, serde_json::Value::Null)).await;
        let categories: Vec<String> = json(response).await;
        assert_eq!(categories, vec!["Animals", "Food"]);
    }
}
