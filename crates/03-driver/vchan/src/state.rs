use std::fmt;

use tracing::info;

/// Externally visible state of a link.
///
/// The discriminants are stable and may be shared with other processes.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Torn down or peer gone. Terminal.
    Disconnected = 0,
    Connected = 1,
    /// Server published its offer and no client has signalled yet.
    Waiting = 2,
}

impl ConnectionState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectionState::Disconnected),
            1 => Some(ConnectionState::Connected),
            2 => Some(ConnectionState::Waiting),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether the link can still carry data now or later.
    pub fn is_open(self) -> bool {
        self != ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Waiting => "waiting",
        };
        f.write_str(name)
    }
}

/// Owns a handle's state and the only transitions it may take:
/// `Waiting -> Connected`, and anything `-> Disconnected`.
#[derive(Debug)]
pub(crate) struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub(crate) fn waiting() -> Self {
        Self {
            state: ConnectionState::Waiting,
        }
    }

    pub(crate) fn connected() -> Self {
        Self {
            state: ConnectionState::Connected,
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.state
    }

    /// `Waiting -> Connected`. Returns false if the handle was not waiting.
    pub(crate) fn peer_connected(&mut self) -> bool {
        if self.state != ConnectionState::Waiting {
            return false;
        }
        self.state = ConnectionState::Connected;
        info!("peer connected");
        true
    }

    pub(crate) fn disconnect(&mut self, reason: &str) -> ConnectionState {
        if self.state != ConnectionState::Disconnected {
            info!(from = %self.state, reason, "disconnected");
            self.state = ConnectionState::Disconnected;
        }
        self.state
    }
}
