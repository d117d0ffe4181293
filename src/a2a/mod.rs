//! A2A gateway: the external agent-to-agent surface.
//!
//! JSON-RPC 2.0 over HTTP POST and WebSocket. The gateway adds
//! authentication, rate limiting, validation, and framing; method
//! semantics are exactly the internal actions'.

pub mod auth;
pub mod rate_limit;
pub mod rpc;
pub mod server;

pub use auth::{A2aClaims, JwtAuthenticator};
pub use rate_limit::{CallerRateLimiter, RateLimitDecision};
pub use rpc::{A2aGateway, RpcRequest, RpcResponse};
pub use server::{a2a_router, A2aServerState};
