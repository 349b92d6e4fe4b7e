//! # rallocator - A segregated free-list memory allocator
//!
//! This crate replaces the bump-allocator arena this codebase started
//! life as with a general-purpose dynamic allocator: a segregated-fit,
//! boundary-tag design over a single monotonically-growing heap region
//! (still driven by `sbrk(2)` in production, exactly like the bump
//! allocator it grew out of).
//!
//! ## Overview
//!
//! Blocks carry a boundary tag (a header word mirrored by a footer
//! word), which is what lets a freed block's *left* neighbor be found
//! in O(1) without any extra metadata. Free blocks are threaded onto
//! `BINS` doubly-linked lists, segregated by `floor(log2(size))`, which
//! turns "find a block big enough" into a first-fit scan that starts
//! close to the right size class instead of a linear walk of every
//! free block in the heap:
//!
//! ```text
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │                         HEAP MEMORY                          │
//!   │  ┌──────┬────────┬──────┬──────────────┬──────┬─────────────┐ │
//!   │  │ pad  │ block  │ free │    block     │ free │   (tail)    │ │
//!   │  │  H   │ (live) │(bin k)│   (live)    │(bin j)│  grows via  │ │
//!   │  └──────┴────────┴──────┴──────────────┴──────┴─────────────┘ │
//!   └──────────────────────────────────────────────────────────────┘
//!
//!   Freeing a block that sits flush against the tail retreats the
//!   tail cursor instead of publishing a free-list entry — the only
//!   way memory ever makes it back to the heap provider.
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rallocator
//!   ├── align     - G-granularity alignment helper
//!   ├── block     - boundary-tag block layout (internal)
//!   ├── heap      - HeapProvider trait, SbrkHeap, MockHeap
//!   ├── bins      - BinnedFreeList, the segregated free list
//!   ├── tail      - TailCursor, the logical end-of-heap
//!   ├── error     - AllocError, Invariant, CheckError
//!   └── allocator - Allocator<H>: init/allocate/free/resize/check
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rallocator::{Allocator, SbrkHeap};
//!
//! fn main() {
//!     let mut a = Allocator::init(SbrkHeap::new()).unwrap();
//!     let p = a.allocate(64).unwrap();
//!     unsafe {
//!         *p.as_ptr() = 42;
//!         a.free(p);
//!     }
//! }
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization primitives; an
//!   `Allocator<H>` is not `Sync`, and sharing one `SbrkHeap` across
//!   threads would race on the process's program break regardless.
//! - **Never shrinks the provider**: freed memory at the tail retreats
//!   the logical cursor, but the heap provider itself only grows; nothing
//!   calls `sbrk` with a negative increment except `reset_brk`, which
//!   discards the whole region at once.
//! - **Unix-only in production**: `SbrkHeap` requires `libc::sbrk`
//!   (POSIX systems). `MockHeap` has no such requirement, which is why
//!   the test suite runs on it instead.
//!
//! ## Safety
//!
//! This crate manages raw memory directly. `allocate` and `resize`
//! return safe `Option<NonNull<u8>>` values, but `free` and `resize`
//! are `unsafe` — both trust the caller to pass a pointer this
//! allocator actually produced and hasn't already freed.

pub mod align;
mod allocator;
mod bins;
mod block;
pub mod error;
mod heap;
mod tail;

pub use allocator::{Allocator, Stats};
pub use error::{AllocError, CheckError, Invariant};
pub use heap::{HeapProvider, MockHeap, SbrkHeap};

/// Granularity in bytes: every block size and every payload pointer is a
/// multiple of `G`.
pub const G: usize = 8;

/// Size in bytes of the header word (and, separately, the footer word)
/// stamped at each end of a block.
pub const H: usize = 4;

/// Minimum block size in bytes: small enough to still hold a header, a
/// footer, and the two-pointer free-list link, rounded up to `G`.
pub const MIN: usize = 24;

/// Number of segregated free-list size classes.
pub const BINS: usize = 28;

/// High bit of a header/footer word marking a block free.
pub const FREE_BIT: u32 = 1 << 31;

/// Leftover (in bytes) at or below which `allocate` serves a free block
/// whole instead of splitting it. Overridable at build time via the
/// `RALLOCATOR_SPLIT_THRESHOLD` environment variable; falls back to a
/// default of 64.
pub const SPLIT_THRESHOLD: usize = parse_or_default(option_env!("RALLOCATOR_SPLIT_THRESHOLD"), 64);

/// Parses a build-time-provided decimal string into a `usize`, at
/// compile time, falling back to `default` if the environment variable
/// was absent or wasn't a valid number. `option_env!` gives us no
/// fallible `const` parsing in `std`, so this walks the bytes by hand.
const fn parse_or_default(value: Option<&str>, default: usize) -> usize {
  let Some(s) = value else {
    return default;
  };
  let bytes = s.as_bytes();
  if bytes.is_empty() {
    return default;
  }
  let mut result: usize = 0;
  let mut i = 0;
  while i < bytes.len() {
    let digit = bytes[i];
    if digit < b'0' || digit > b'9' {
      return default;
    }
    result = result * 10 + (digit - b'0') as usize;
    i += 1;
  }
  result
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_or_default_falls_back_on_absence_or_garbage() {
    assert_eq!(parse_or_default(None, 64), 64);
    assert_eq!(parse_or_default(Some(""), 64), 64);
    assert_eq!(parse_or_default(Some("abc"), 64), 64);
    assert_eq!(parse_or_default(Some("128"), 64), 128);
  }

  #[test]
  fn constants_are_internally_consistent() {
    assert!(MIN >= 2 * H + block_link_size());
    assert_eq!(MIN % G, 0);
  }

  fn block_link_size() -> usize {
    2 * std::mem::size_of::<*mut u8>()
  }
}
