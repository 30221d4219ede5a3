pub mod auth;
pub mod comments;
pub mod events;
pub mod files;
pub mod groups;
pub mod messages;
pub mod notifications;
pub mod posts;
pub mod realtime;
pub mod users;

use axum::middleware;
use axum::Router;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::extractors::extend_session;
use crate::state::AppState;

/// `?before_id=` cursor shared by every listing.
#[derive(Debug, Default, Deserialize)]
pub struct Page {
    pub before_id: Option<i64>,
}

/// The complete HTTP surface, ready to serve.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(auth::router())
        .merge(users::router())
        .merge(posts::router())
        .merge(comments::router())
        .merge(groups::router())
        .merge(events::router())
        .merge(messages::router())
        .merge(notifications::router())
        .merge(files::router(&state.config))
        .merge(realtime::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn_with_state(state.clone(), extend_session)),
        )
        .with_state(state)
}
