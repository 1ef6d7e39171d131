//! axum middleware running every request through the [`AuthEngine`].

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, info};

use super::engine::{AuthEngine, Decision};
use super::request::GateRequest;

/// Authenticate the request or answer for the next handler.
///
/// Forwarded requests carry the session [`Identity`](crate::identity::Identity)
/// in their extensions; bypassed requests carry none.
pub async fn auth_middleware(
    State(engine): State<Arc<AuthEngine>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let gate_request = GateRequest::from_request(&request, engine.trusts_forwarded_headers());
    let host = gate_request.host.clone();
    let path = gate_request.path.clone();

    let decision = engine.decide(gate_request).await;
    let state = decision.state();

    match decision {
        Decision::Bypass => {
            debug!(host = %host, path = %path, state = %state, "Forwarding without authentication");
            next.run(request).await
        }
        Decision::Resume(identity) => {
            debug!(host = %host, path = %path, user = %identity, state = %state, "Forwarding");
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Decision::Established {
            identity,
            method,
            location,
            headers,
        } => {
            info!(
                host = %host,
                user = %identity,
                method = %method,
                state = %state,
                location = %location,
                "Redirecting with new session"
            );
            redirect(&location, headers)
        }
        Decision::Unauthorized { challenge } => {
            debug!(host = %host, path = %path, state = %state, "Rejecting request");
            unauthorized(challenge)
        }
        Decision::SessionFailure => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

/// 302 to `location` with the session headers attached.
fn redirect(location: &str, headers: axum::http::HeaderMap) -> Response {
    let Ok(location) = HeaderValue::from_str(location) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
    };

    let mut response = (StatusCode::FOUND, headers).into_response();
    response.headers_mut().insert(header::LOCATION, location);
    response
}

/// 401, with `WWW-Authenticate` when a challenge applies.
fn unauthorized(challenge: Option<HeaderValue>) -> Response {
    let mut response = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    if let Some(challenge) = challenge {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, challenge);
    }
    response
}
