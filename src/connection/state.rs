use serde::Serialize;
use strum_macros::Display;

/// Lifecycle of the link to one peripheral.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    #[strum(to_string = "undetermined")]
    Undetermined,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "disconnecting")]
    Disconnecting,
    #[strum(to_string = "disconnected")]
    Disconnected,
}

/// Inputs that drive [`ConnectionState`] transitions.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum ConnectionEvent {
    ConnectRequested,
    LinkEstablished,
    DisconnectRequested,
    LinkLost,
    AttemptFailed,
}

impl ConnectionState {
    /// Maps a platform profile-state constant. Unknown values are `Undetermined`.
    #[must_use]
    pub fn from_platform_code(code: i32) -> Self {
        match code {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Disconnecting,
            _ => Self::Undetermined,
        }
    }

    /// Returns the state that follows `event`. Defined for every pair.
    #[must_use]
    pub fn on(self, event: ConnectionEvent) -> Self {
        match (self, event) {
            (Self::Connected | Self::Disconnecting, ConnectionEvent::ConnectRequested) => self,
            (_, ConnectionEvent::ConnectRequested) => Self::Connecting,
            (Self::Disconnecting, ConnectionEvent::LinkEstablished) => self,
            (_, ConnectionEvent::LinkEstablished) => Self::Connected,
            (Self::Connecting | Self::Connected, ConnectionEvent::DisconnectRequested) => {
                Self::Disconnecting
            }
            (Self::Disconnecting, ConnectionEvent::DisconnectRequested) => self,
            (
                Self::Undetermined | Self::Disconnected,
                ConnectionEvent::DisconnectRequested,
            ) => Self::Disconnected,
            (_, ConnectionEvent::LinkLost | ConnectionEvent::AttemptFailed) => Self::Disconnected,
        }
    }

    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}
