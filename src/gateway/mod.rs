//! HTTP front door for pairing.
//!
//! - `GET /code?number=<phone>` starts a pairing session and returns its code.
//! - `GET /health` answers liveness checks and the keep-alive pinger.

pub mod server;
pub mod types;

pub use server::{GatewayState, RateLimiter, start_server};
