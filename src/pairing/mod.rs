//! Pairing sessions.
//!
//! A pairing session turns a phone number into a short code the user types
//! on their primary device. Each session gets its own credential namespace
//! in the [`SessionStore`], its own protocol connection and a driver task
//! that decides when to ask for the code and what to do when the
//! connection closes.

mod code;
mod manager;
mod session;
mod store;

pub use code::{PairingCode, mask_phone_number, normalize_phone_number};
pub use manager::{PairingConfig, PairingSessionManager, SessionSnapshot};
pub use session::{ConnectionPhase, PairingOutcome, PendingResponse, PhaseEvent, SessionId};
pub use store::{
    CredentialDelta, CredentialHandle, CredentialState, FileSessionStore, REGISTERED_FIELD,
    SessionStore,
};
