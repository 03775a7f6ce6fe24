pub mod purpose;
pub mod session_state;

pub use purpose::{Purpose, UnknownPurpose};
pub use session_state::SessionState;

/// Small integer naming one application-level session with the gateway.
pub type ClientId = u32;
