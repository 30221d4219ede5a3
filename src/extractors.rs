use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::state::AppState;
use crate::visibility::Viewer;

/// Represents the currently authenticated user.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    /// The session token the request was authenticated with.
    pub token: String,
}

/// Extractor that requires authentication.
/// Returns 401 if no live session is found.
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        // A stale cookie must not shadow a valid bearer token.
        for token in session_tokens(&parts.headers, &state.config.auth.cookie_name) {
            if let Some(session) = state.sessions.resolve(token).await? {
                return Ok(CurrentUser {
                    id: session.user_id,
                    token: session.token,
                });
            }
        }
        Err(AppError::Unauthorized)
    }
}

/// Optional user extractor — `None` instead of 401 when not authenticated.
pub struct MaybeUser(pub Option<CurrentUser>);

impl MaybeUser {
    pub fn viewer(&self) -> Viewer {
        match &self.0 {
            Some(user) => Viewer::User(user.id),
            None => Viewer::Anonymous,
        }
    }
}

impl FromRequestParts<AppState> for MaybeUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match CurrentUser::from_request_parts(parts, state).await {
            Ok(user) => Ok(MaybeUser(Some(user))),
            Err(AppError::Unauthorized) => Ok(MaybeUser(None)),
            Err(e) => Err(e),
        }
    }
}

fn cookie_token<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(';'))
        .map(|s| s.trim())
        .find_map(|cookie| {
            let mut split = cookie.splitn(2, '=');
            let key = split.next()?.trim();
            let val = split.next()?.trim();
            if key == cookie_name && !val.is_empty() {
                Some(val)
            } else {
                None
            }
        })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Candidate session tokens in the order they are tried: the session cookie,
/// then `Authorization: Bearer`.
pub fn session_tokens<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Vec<&'a str> {
    let mut tokens: Vec<&str> = cookie_token(headers, cookie_name).into_iter().collect();
    if let Some(bearer) = bearer_token(headers) {
        if !tokens.contains(&bearer) {
            tokens.push(bearer);
        }
    }
    tokens
}

// -- Cookie helpers --

pub fn session_cookie(name: &str, token: &str, expires_at: DateTime<Utc>) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Expires={}",
        name,
        token,
        expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    )
}

pub fn clear_session_cookie(name: &str) -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", name)
}

/// Middleware that slides the expiry of any live session the request carries
/// and hands the client a refreshed cookie. Handlers that set their own
/// cookie (login, logout) win.
pub async fn extend_session(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let tokens: Vec<String> = session_tokens(req.headers(), &state.config.auth.cookie_name)
        .into_iter()
        .map(str::to_string)
        .collect();

    let ttl = state.sessions.ttl();
    let mut refreshed = None;
    for token in tokens {
        match state.sessions.extend(&token, ttl).await {
            Ok(true) => {
                refreshed = Some((token, Utc::now() + ttl));
                break;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Failed to extend session: {}", e);
                break;
            }
        }
    }

    let mut response = next.run(req).await;

    if let Some((token, expires_at)) = refreshed {
        if !response.headers().contains_key(header::SET_COOKIE) {
            let cookie = session_cookie(&state.config.auth.cookie_name, &token, expires_at);
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
        }
    }

    response
}
