//! Block layout: header/footer encoding and the free-list link record.
//!
//! A block occupies `[base, base + size)`. The header word lives at
//! `base`, the footer word (a copy of the header) lives at
//! `base + size - H`, and the payload starts at `base + H`. When a block
//! is free, its payload's first two machine words hold the doubly-linked
//! free-list's `prev`/`next` pointers instead of user data — this is why
//! `MIN` reserves room for two pointers even though a used block's
//! payload can be as small as the caller asked for.
//!
//! Every function here trusts its caller to pass a valid block base; none
//! of this is bounds-checked against the heap extent, because the
//! allocator core is the only caller and it already knows the extent.

use std::mem;
use std::ptr;

use crate::{FREE_BIT, G, H};

#[inline]
unsafe fn read_u32(addr: *mut u8) -> u32 {
  unsafe { ptr::read(addr as *mut u32) }
}

#[inline]
unsafe fn write_u32(addr: *mut u8, value: u32) {
  unsafe { ptr::write(addr as *mut u32, value) }
}

/// Decodes a header/footer word into `(size_in_bytes, is_free)`.
#[inline]
pub fn decode(word: u32) -> (usize, bool) {
  let free = word & FREE_BIT != 0;
  let size = ((word & !FREE_BIT) as usize) * G;
  (size, free)
}

/// Encodes a block's size and free-flag into a header/footer word.
#[inline]
pub fn encode(size_bytes: usize, free: bool) -> u32 {
  debug_assert_eq!(size_bytes % G, 0, "block size must be a multiple of G");
  let units = (size_bytes / G) as u32;
  if free { units | FREE_BIT } else { units }
}

/// Reads the header word at block base `base`.
pub unsafe fn header(base: *mut u8) -> u32 {
  unsafe { read_u32(base) }
}

/// Address of the footer word for a block of the given size.
#[inline]
pub unsafe fn footer_addr(base: *mut u8, size_bytes: usize) -> *mut u8 {
  unsafe { base.add(size_bytes - H) }
}

/// Reads the footer word for a block of the given size.
pub unsafe fn footer(base: *mut u8, size_bytes: usize) -> u32 {
  unsafe { read_u32(footer_addr(base, size_bytes)) }
}

/// Size in bytes of the block at `base`, read from its header.
pub unsafe fn size_of(base: *mut u8) -> usize {
  let (size, _) = decode(unsafe { header(base) });
  size
}

/// Whether the block at `base` is currently free, read from its header.
pub unsafe fn is_free(base: *mut u8) -> bool {
  let (_, free) = decode(unsafe { header(base) });
  free
}

/// Writes identical header and footer words for a block of `size_bytes`
/// at `base`, encoding `free`. This is the only way block metadata
/// should be written — header and footer must never drift apart.
pub unsafe fn stamp(base: *mut u8, size_bytes: usize, free: bool) {
  let word = encode(size_bytes, free);
  unsafe {
    write_u32(base, word);
    write_u32(footer_addr(base, size_bytes), word);
  }
}

/// The payload pointer handed to (or received from) the user for a block
/// based at `base`.
#[inline]
pub unsafe fn payload_ptr(base: *mut u8) -> *mut u8 {
  unsafe { base.add(H) }
}

/// Recovers a block's base address from a payload pointer.
#[inline]
pub unsafe fn base_of_payload(payload: *mut u8) -> *mut u8 {
  unsafe { payload.sub(H) }
}

/// Base address of the block immediately to the right of a block of
/// `size_bytes` based at `base`.
#[inline]
pub unsafe fn right_neighbor(base: *mut u8, size_bytes: usize) -> *mut u8 {
  unsafe { base.add(size_bytes) }
}

/// Inspects the left neighbor of the block at `base` via its footer,
/// returning `(left_base, left_is_free)`.
///
/// # Safety
///
/// Undefined for the leftmost block in the heap: the word at
/// `base - H` is only a valid footer once a left neighbor actually
/// exists. Callers must check `base > heap_lo` first.
pub unsafe fn left_neighbor(base: *mut u8) -> (*mut u8, bool) {
  let prev_footer_addr = unsafe { base.sub(H) };
  let (prev_size, prev_free) = decode(unsafe { read_u32(prev_footer_addr) });
  let prev_base = unsafe { base.sub(prev_size) };
  (prev_base, prev_free)
}

/// Reads the `(prev, next)` free-list link stored in a free block's
/// payload.
pub unsafe fn read_link(base: *mut u8) -> (*mut u8, *mut u8) {
  let slots = unsafe { payload_ptr(base) } as *mut *mut u8;
  unsafe { (ptr::read(slots), ptr::read(slots.add(1))) }
}

/// Writes the `(prev, next)` free-list link into a free block's payload.
pub unsafe fn write_link(base: *mut u8, prev: *mut u8, next: *mut u8) {
  let slots = unsafe { payload_ptr(base) } as *mut *mut u8;
  unsafe {
    ptr::write(slots, prev);
    ptr::write(slots.add(1), next);
  }
}

/// Bytes of overhead (header + footer) every block carries regardless of
/// payload size.
pub const OVERHEAD: usize = 2 * H;

/// Size in bytes of the link record a free block's payload must have
/// room for (two machine pointers).
pub const LINK_SIZE: usize = 2 * mem::size_of::<*mut u8>();
