//! Handshake and connection lifecycle for a shared-memory link between two
//! domains.
//!
//! A server publishes one shared page and an event channel port under a
//! channel number in the rendezvous directory; a client discovers them, maps
//! the page and binds the port. Either way the caller ends up with a [`Vchan`]
//! whose write and read streams are already bound for its [`Role`].
//!
//! * [`Vchan::server_init`] / [`Vchan::handle_connected`] – publish and wait.
//! * [`Vchan::client_init`] – discover, map and bind.
//! * [`Vchan::state`] – liveness-aware [`ConnectionState`].
//! * [`Vchan::teardown`] / [`Vchan::close`] – ordered, idempotent release.

mod client;
mod config;
mod endpoint;
mod error;
mod handle;
mod mapping;
pub mod rendezvous;
mod resources;
mod server;
mod state;

pub use config::{InitMode, ServerConfig, WireVersion};
pub use error::{DiscoveryFailure, VchanError, VchanResult};
pub use handle::Vchan;
pub use mapping::{MappingKind, RingReference};
pub use rendezvous::ChannelNumber;
pub use state::ConnectionState;

pub use vchan_hv::{DomainId, HvContext, Port, WaitOutcome};
pub use vchan_ring::{Direction, DirectionBinding, RingDescriptor, Role, StreamView};
