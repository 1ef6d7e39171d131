//! HTTP router for the standalone forward-auth server.

use std::sync::Arc;

use axum::{
    Extension, Router,
    extract::State,
    middleware,
    response::{IntoResponse, Response},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};

use super::engine::AuthEngine;
use super::middleware::auth_middleware;
use crate::identity::Identity;

/// Every path, any method, goes through the gate. What reaches the handler
/// has either a session or a bypass rule behind it.
pub fn create_router(engine: Arc<AuthEngine>) -> Router {
    Router::new()
        .fallback(authenticated_handler)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&engine),
            auth_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn authenticated_handler(
    State(engine): State<Arc<AuthEngine>>,
    identity: Option<Extension<Identity>>,
) -> Response {
    match identity {
        Some(Extension(identity)) => format!(
            "hello, {identity}. you should now be authenticated for {}!",
            engine.domain()
        )
        .into_response(),
        None => "OK".into_response(),
    }
}
