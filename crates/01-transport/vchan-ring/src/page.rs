//! Page-sized backing memory for the ring descriptor.
//!
//! Locally allocated pages prefer an anonymous `mmap` (page aligned and
//! zero-filled by the kernel). When that is not possible we fall back to an
//! aligned heap allocation. Pages mapped in from another domain are wrapped as
//! foreign views: the provider that mapped them owns the memory and this type
//! never frees it. Providers that share one address space with the owner use
//! [`SharedPage::foreign_view`], which pins the owner's page instead.

use crate::layout::RingDescriptor;
use crate::{RingError, RingResult, RING_DESCRIPTOR_SIZE};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::mem::align_of;
use std::ptr::NonNull;
use std::sync::Arc;

/// Size of the single page a vchan link shares.
pub const PAGE_SIZE: usize = 4096;

#[derive(Debug)]
enum Backing {
    #[cfg(not(target_arch = "wasm32"))]
    Native(memmap2::MmapMut),
    Owned {
        ptr: NonNull<u8>,
        layout: Layout,
    },
    Foreign {
        ptr: NonNull<u8>,
        _owner: Option<Arc<SharedPage>>,
    },
}

impl Backing {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            #[cfg(not(target_arch = "wasm32"))]
            Backing::Native(map) => map.as_ptr() as *mut u8,
            Backing::Owned { ptr, .. } | Backing::Foreign { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// One page of memory that both domains may observe concurrently.
///
/// All access to the contents goes through [`RingDescriptor`], whose fields are
/// atomics or raw buffer pointers, so the page can be shared freely between
/// threads standing in for separate domains.
#[derive(Debug)]
pub struct SharedPage {
    len: usize,
    backing: Backing,
}

// SAFETY: the page is plain memory; every read and write of its contents goes
// through atomics or raw pointers handed out by `RingDescriptor`.
unsafe impl Send for SharedPage {}
// SAFETY: see `Send`; shared references never produce `&mut` into the page.
unsafe impl Sync for SharedPage {}

impl SharedPage {
    /// Allocates a zeroed, page-aligned page owned by this domain.
    pub fn allocate() -> RingResult<Self> {
        #[cfg(not(target_arch = "wasm32"))]
        {
            if let Some(page) = Self::mmap_backed() {
                return Ok(page);
            }
        }

        Self::heap_backed()
    }

    #[cfg(not(target_arch = "wasm32"))]
    fn mmap_backed() -> Option<Self> {
        let map = memmap2::MmapOptions::new()
            .len(PAGE_SIZE)
            .map_anon()
            .ok()?;
        if map.as_ptr() as usize % PAGE_SIZE != 0 {
            return None;
        }
        Some(Self {
            len: PAGE_SIZE,
            backing: Backing::Native(map),
        })
    }

    fn heap_backed() -> RingResult<Self> {
        let err = RingError::AllocationFailed {
            size: PAGE_SIZE,
            alignment: PAGE_SIZE,
        };
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).map_err(|_| err.clone())?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(err)?;
        Ok(Self {
            len: PAGE_SIZE,
            backing: Backing::Owned { ptr, layout },
        })
    }

    /// Wraps memory mapped from another domain.
    ///
    /// # Safety
    /// `ptr` must address `len` readable and writable bytes that stay mapped
    /// until this value is dropped and the provider has released the mapping.
    pub unsafe fn from_foreign(ptr: NonNull<u8>, len: usize) -> RingResult<Self> {
        if len < RING_DESCRIPTOR_SIZE {
            return Err(RingError::PageTooSmall {
                len,
                required: RING_DESCRIPTOR_SIZE,
            });
        }
        let alignment = align_of::<RingDescriptor>();
        if ptr.as_ptr() as usize % alignment != 0 {
            return Err(RingError::Misaligned {
                addr: ptr.as_ptr() as usize,
                alignment,
            });
        }
        Ok(Self {
            len,
            backing: Backing::Foreign { ptr, _owner: None },
        })
    }

    /// Foreign view of a page another domain owns in this address space.
    ///
    /// The view holds a reference to `owner`, so the memory stays valid for as
    /// long as the view exists.
    pub fn foreign_view(owner: &Arc<SharedPage>) -> RingResult<Self> {
        let ptr = NonNull::from(owner.ring()).cast::<u8>();
        // SAFETY: `owner` addresses `owner.len()` bytes and the view keeps it
        // alive until the view itself is dropped.
        let mut view = unsafe { Self::from_foreign(ptr, owner.len())? };
        view.backing = Backing::Foreign {
            ptr,
            _owner: Some(Arc::clone(owner)),
        };
        Ok(view)
    }

    /// Total number of bytes in the page.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the page has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when the memory belongs to another domain's mapping.
    pub fn is_foreign(&self) -> bool {
        matches!(self.backing, Backing::Foreign { .. })
    }

    /// Base address of the page.
    pub fn as_ptr(&self) -> *mut u8 {
        self.backing.as_ptr()
    }

    /// Interprets the start of the page as the ring descriptor.
    pub fn ring(&self) -> &RingDescriptor {
        // SAFETY: every constructor guarantees at least `RING_DESCRIPTOR_SIZE`
        // bytes at an address aligned for `RingDescriptor`, and the descriptor
        // is made only of atomics and `UnsafeCell` buffers, so any bit pattern
        // is a valid value.
        unsafe { &*(self.as_ptr() as *const RingDescriptor) }
    }
}

impl Drop for SharedPage {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            // SAFETY: `ptr` came from `alloc_zeroed(layout)` in `heap_backed`.
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}
