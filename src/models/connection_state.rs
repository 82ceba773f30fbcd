use std::fmt::Display;

/// Lifecycle of the physical link owned by the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No handle is open. Initial and terminal state.
    #[default]
    Disconnected,

    /// A permission request is pending with the platform.
    AwaitingPermission,

    /// Permission is granted and the handle is being opened and configured.
    Connecting,

    /// The handle is open and the reader is running.
    Connected,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::AwaitingPermission => "AwaitingPermission",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        write!(f, "{}", name)
    }
}
