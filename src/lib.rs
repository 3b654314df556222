//! pairlink: phone-number pairing sessions for linking a secondary device to
//! a messaging account.
//!
//! A request carrying a phone number gets its own session id, a credential
//! namespace in the [`pairing::SessionStore`] and a protocol connection. After
//! a short settling delay the connection is asked for a pairing code, which
//! is returned to the caller exactly once. Sessions closed by an
//! authoritative logout have their storage purged; any other close keeps it.

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod keepalive;
pub mod observability;
pub mod pairing;
pub mod protocol;

pub use config::Config;
