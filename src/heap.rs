//! The heap-region provider this allocator sits on top of.
//!
//! `HeapProvider` is the "brk-like region manager" contract from the
//! allocator's point of view: grow the region, report its bounds, reset
//! it. `SbrkHeap` is the real provider, driving the process break with
//! `libc::sbrk`. `MockHeap` is a fixed-capacity, heap-allocated buffer
//! stand-in so the allocator core and its tests never have to fight over
//! one process's program break.

use std::ptr;

/// A contiguous, monotonically-growing region of memory an allocator can
/// carve blocks out of.
pub trait HeapProvider {
  /// Begins a fresh region of length 0. `lo()`/`hi()` are undefined until
  /// the next successful `grow`.
  fn init(&mut self);

  /// Extends the region by `n_bytes`, returning the address of the first
  /// new byte, or `Err(())` if the region cannot grow that far.
  fn grow(&mut self, n_bytes: usize) -> Result<*mut u8, ()>;

  /// Discards every byte grown so far. `lo()`/`hi()` are undefined until
  /// the next successful `grow`.
  fn reset(&mut self);

  /// Lowest valid address in the region.
  fn lo(&self) -> *mut u8;

  /// Highest valid address in the region (inclusive).
  fn hi(&self) -> *mut u8;

  /// Current size of the region in bytes.
  fn size(&self) -> usize;
}

/// The production heap provider: grows the process's data segment via
/// `sbrk(2)`.
///
/// Only one `SbrkHeap` should be in use at a time — it drives one
/// process-wide resource, so two independent `SbrkHeap`s (or an
/// `SbrkHeap` alongside anything else that calls `sbrk`) would fight
/// over the same program break.
pub struct SbrkHeap {
  origin: *mut u8,
  size: usize,
}

impl SbrkHeap {
  pub const fn new() -> Self {
    Self { origin: ptr::null_mut(), size: 0 }
  }
}

impl Default for SbrkHeap {
  fn default() -> Self {
    Self::new()
  }
}

impl HeapProvider for SbrkHeap {
  fn init(&mut self) {
    self.origin = ptr::null_mut();
    self.size = 0;
  }

  fn grow(&mut self, n_bytes: usize) -> Result<*mut u8, ()> {
    let addr = unsafe { libc::sbrk(n_bytes as libc::intptr_t) };
    if addr as isize == -1 {
      return Err(());
    }
    if self.origin.is_null() {
      self.origin = addr as *mut u8;
    }
    self.size += n_bytes;
    Ok(addr as *mut u8)
  }

  fn reset(&mut self) {
    if self.size > 0 {
      unsafe {
        libc::sbrk(-(self.size as libc::intptr_t));
      }
    }
    self.origin = ptr::null_mut();
    self.size = 0;
  }

  fn lo(&self) -> *mut u8 {
    self.origin
  }

  fn hi(&self) -> *mut u8 {
    if self.size == 0 {
      self.origin
    } else {
      unsafe { self.origin.add(self.size - 1) }
    }
  }

  fn size(&self) -> usize {
    self.size
  }
}

/// A test double standing in for the heap provider: a fixed-capacity
/// buffer that never reallocates, so pointers handed out by `grow` stay
/// valid for the buffer's lifetime.
///
/// `capacity` is the implementation limit a provider's `grow` contract
/// allows it to enforce; once exhausted, `grow` fails the same way a
/// real `sbrk` does when `RLIMIT_DATA` is hit.
pub struct MockHeap {
  storage: Box<[u8]>,
  used: usize,
}

impl MockHeap {
  pub fn with_capacity(capacity: usize) -> Self {
    Self { storage: vec![0u8; capacity].into_boxed_slice(), used: 0 }
  }

  fn origin(&self) -> *mut u8 {
    self.storage.as_ptr() as *mut u8
  }
}

impl HeapProvider for MockHeap {
  fn init(&mut self) {
    self.used = 0;
  }

  fn grow(&mut self, n_bytes: usize) -> Result<*mut u8, ()> {
    if self.used + n_bytes > self.storage.len() {
      return Err(());
    }
    let addr = unsafe { self.origin().add(self.used) };
    self.used += n_bytes;
    Ok(addr)
  }

  fn reset(&mut self) {
    self.used = 0;
  }

  fn lo(&self) -> *mut u8 {
    self.origin()
  }

  fn hi(&self) -> *mut u8 {
    if self.used == 0 {
      self.origin()
    } else {
      unsafe { self.origin().add(self.used - 1) }
    }
  }

  fn size(&self) -> usize {
    self.used
  }
}
