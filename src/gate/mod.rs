//! The request gate: decision engine, axum middleware and the standalone
//! forward-auth server.

mod engine;
mod middleware;
mod request;
mod router;
mod server;

pub use engine::{AuthEngine, Decision, GateState};
pub use middleware::auth_middleware;
pub use request::{BasicCredentials, GateRequest};
pub use router::create_router;
pub use server::Server;
