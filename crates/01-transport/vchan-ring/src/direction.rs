//! Role-to-direction binding.
//!
//! Transport code is written once in terms of "write" and "read" streams.
//! [`bind_directions`] decides which physical buffer each of those is for a
//! given role: whatever the server writes, the client reads, and the other way
//! around.

use crate::layout::{TO_CLIENT_CAPACITY, TO_SERVER_CAPACITY};
use std::fmt;

/// Which side of the link a handle plays. Fixed for the handle's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Allocates and publishes the shared page.
    Server,
    /// Discovers and maps the page published by a server.
    Client,
}

impl Role {
    /// The role on the other end of the link.
    pub const fn peer(self) -> Role {
        match self {
            Role::Server => Role::Client,
            Role::Client => Role::Server,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => f.write_str("server"),
            Role::Client => f.write_str("client"),
        }
    }
}

/// Physical direction of a buffer in the ring descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    ToClient,
    ToServer,
}

impl Direction {
    pub const fn capacity(self) -> usize {
        match self {
            Direction::ToClient => TO_CLIENT_CAPACITY,
            Direction::ToServer => TO_SERVER_CAPACITY,
        }
    }

    /// The role that produces into this buffer.
    pub const fn producer(self) -> Role {
        match self {
            Direction::ToClient => Role::Server,
            Direction::ToServer => Role::Client,
        }
    }
}

/// Write/read assignment for one end of the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectionBinding {
    pub write: Direction,
    pub read: Direction,
}

/// Assigns the write and read streams for `role`.
pub const fn bind_directions(role: Role) -> DirectionBinding {
    match role {
        Role::Server => DirectionBinding {
            write: Direction::ToClient,
            read: Direction::ToServer,
        },
        Role::Client => DirectionBinding {
            write: Direction::ToServer,
            read: Direction::ToClient,
        },
    }
}
