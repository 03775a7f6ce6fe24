use serde::Serialize;

// -----------------------------------------------------------------------------
// ----- SessionState ----------------------------------------------------------

/// Lifecycle of one pooled gateway session.
///
/// `Disconnected -> Connecting -> Connected -> {Reconnecting -> Connected | Failed} -> Closing`.
/// A transport-level disconnect moves `Connected` back to `Disconnected`; the
/// health loop then evicts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closing,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected) | (Connecting, Failed) => true,
            (Connected, Reconnecting) | (Connected, Failed) | (Connected, Disconnected) => true,
            (Reconnecting, Connected) | (Reconnecting, Failed) => true,
            (Closing, _) => false,
            // Any live state may be torn down.
            (_, Closing) => true,
            _ => false,
        }
    }

    pub fn is_usable(self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Failed => "failed",
            SessionState::Closing => "closing",
        }
    }
}


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
