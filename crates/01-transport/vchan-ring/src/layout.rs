//! Ring descriptor layout shared by both ends of a link.
//!
//! ```text
//! +0     to_client.consumer   u32
//! +4     to_client.producer   u32
//! +8     to_server.consumer   u32
//! +12    to_server.producer   u32
//! +16    debug sentinel       u32 (0xAABBCCDD)
//! +20    client_closed        u32
//! +24    server_closed        u32
//! +28    to_client buffer     1024 bytes
//! +1052  to_server buffer     2048 bytes
//! ```
//!
//! Cursors are free-running byte counts compared with wrapping arithmetic; a
//! cursor is reduced modulo the buffer capacity only to address a byte. Each
//! closed flag has exactly one writer (its owning role) and is never cleared
//! once set. How bytes move through the buffers belongs to the transport that
//! sits on top of this layout.

use crate::page::PAGE_SIZE;
use crate::{Direction, RingError, RingResult, Role};
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};

/// Capacity of the buffer written by the server.
pub const TO_CLIENT_CAPACITY: usize = 1024;
/// Capacity of the buffer written by the client.
pub const TO_SERVER_CAPACITY: usize = 2048;
/// Value stamped into the descriptor by the server; catches mapping the wrong page.
pub const DEBUG_SENTINEL: u32 = 0xAABB_CCDD;

#[repr(C)]
struct Cursors {
    consumer: AtomicU32,
    producer: AtomicU32,
}

/// Shared ring descriptor living at the start of the granted page.
#[repr(C)]
pub struct RingDescriptor {
    to_client: Cursors,
    to_server: Cursors,
    debug: AtomicU32,
    client_closed: AtomicU32,
    server_closed: AtomicU32,
    buf_to_client: UnsafeCell<[u8; TO_CLIENT_CAPACITY]>,
    buf_to_server: UnsafeCell<[u8; TO_SERVER_CAPACITY]>,
}

/// Size in bytes of [`RingDescriptor`].
pub const RING_DESCRIPTOR_SIZE: usize = size_of::<RingDescriptor>();

const _: () = assert!(RING_DESCRIPTOR_SIZE == 28 + TO_CLIENT_CAPACITY + TO_SERVER_CAPACITY);
const _: () = assert!(RING_DESCRIPTOR_SIZE <= PAGE_SIZE);
const _: () = assert!(TO_CLIENT_CAPACITY.is_power_of_two() && TO_SERVER_CAPACITY.is_power_of_two());

// SAFETY: the cursors, flags and sentinel are atomics; the buffers are only
// reachable through raw pointers whose use is governed by the cursor protocol.
unsafe impl Sync for RingDescriptor {}

impl RingDescriptor {
    /// Zeroes all four cursors and both closed flags, then stamps the sentinel.
    ///
    /// Only the allocating side calls this, before the page reference is
    /// published.
    pub fn initialize(&self) {
        for cursors in [&self.to_client, &self.to_server] {
            cursors.consumer.store(0, Ordering::Relaxed);
            cursors.producer.store(0, Ordering::Relaxed);
        }
        self.client_closed.store(0, Ordering::Relaxed);
        self.server_closed.store(0, Ordering::Relaxed);
        self.debug.store(DEBUG_SENTINEL, Ordering::Release);
    }

    /// Current sentinel value.
    pub fn sentinel(&self) -> u32 {
        self.debug.load(Ordering::Acquire)
    }

    /// Checks that the page looks like an initialised descriptor.
    pub fn validate(&self) -> RingResult<()> {
        let found = self.sentinel();
        if found != DEBUG_SENTINEL {
            return Err(RingError::SentinelMismatch {
                expected: DEBUG_SENTINEL,
                found,
            });
        }
        Ok(())
    }

    fn closed_flag(&self, role: Role) -> &AtomicU32 {
        match role {
            Role::Server => &self.server_closed,
            Role::Client => &self.client_closed,
        }
    }

    /// Sets the closed flag owned by `role`. There is no way to clear it.
    pub fn mark_closed(&self, role: Role) {
        self.closed_flag(role).store(1, Ordering::Release);
    }

    /// Whether `role` has declared its end closed.
    pub fn is_closed(&self, role: Role) -> bool {
        self.closed_flag(role).load(Ordering::Acquire) != 0
    }

    /// Whether either end has declared itself closed.
    pub fn any_closed(&self) -> bool {
        self.is_closed(Role::Server) || self.is_closed(Role::Client)
    }

    /// Borrowed view of one directional buffer and its cursor pair.
    pub fn stream(&self, direction: Direction) -> StreamView<'_> {
        let (cursors, buf, capacity) = match direction {
            Direction::ToClient => (
                &self.to_client,
                self.buf_to_client.get().cast::<u8>(),
                TO_CLIENT_CAPACITY,
            ),
            Direction::ToServer => (
                &self.to_server,
                self.buf_to_server.get().cast::<u8>(),
                TO_SERVER_CAPACITY,
            ),
        };
        StreamView {
            direction,
            cursors,
            buf,
            capacity,
            _ring: PhantomData,
        }
    }
}

/// One direction of the ring: a producer cursor, a consumer cursor and the
/// bytes between them.
pub struct StreamView<'a> {
    direction: Direction,
    cursors: &'a Cursors,
    buf: *mut u8,
    capacity: usize,
    _ring: PhantomData<&'a RingDescriptor>,
}

impl<'a> StreamView<'a> {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Fixed capacity of the buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Logical count of bytes ever produced.
    pub fn producer(&self) -> u32 {
        self.cursors.producer.load(Ordering::Acquire)
    }

    /// Logical count of bytes ever consumed.
    pub fn consumer(&self) -> u32 {
        self.cursors.consumer.load(Ordering::Acquire)
    }

    pub fn producer_cursor(&self) -> &'a AtomicU32 {
        &self.cursors.producer
    }

    pub fn consumer_cursor(&self) -> &'a AtomicU32 {
        &self.cursors.consumer
    }

    /// Bytes produced but not yet consumed.
    pub fn pending(&self) -> u32 {
        let consumer = self.consumer();
        self.producer().wrapping_sub(consumer)
    }

    /// Bytes the producer may still write without overrunning the consumer.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.pending() as usize)
    }

    /// True while `0 <= producer - consumer <= capacity` holds.
    pub fn is_consistent(&self) -> bool {
        self.pending() as usize <= self.capacity
    }

    /// Offset inside the buffer addressed by a logical cursor value.
    pub fn offset_of(&self, cursor: u32) -> usize {
        cursor as usize & (self.capacity - 1)
    }

    /// Start of the buffer in the shared page.
    pub fn buffer_ptr(&self) -> *mut u8 {
        self.buf
    }
}
