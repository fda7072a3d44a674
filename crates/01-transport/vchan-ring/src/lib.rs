//! Shared-memory data model for a vchan link.
//!
//! This crate owns everything both domains agree on byte-for-byte:
//! * [`SharedPage`] – one page-aligned page that backs the ring descriptor.
//! * [`RingDescriptor`] – the `#[repr(C)]` layout with two directional buffers,
//!   four cursors, two closed flags and a debug sentinel.
//! * [`bind_directions`] – maps a [`Role`] onto the write/read stream pair so the
//!   same transport code runs unchanged on both ends.
//! * [`RingError`] – layout/allocation failures.

mod direction;
mod error;
mod layout;
mod page;

pub use direction::{bind_directions, Direction, DirectionBinding, Role};
pub use error::{RingError, RingResult};
pub use layout::{
    RingDescriptor, StreamView, DEBUG_SENTINEL, RING_DESCRIPTOR_SIZE, TO_CLIENT_CAPACITY,
    TO_SERVER_CAPACITY,
};
pub use page::{SharedPage, PAGE_SIZE};
