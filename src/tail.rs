//! The tail cursor: the allocator's logical end-of-heap, which may sit
//! behind the heap provider's physical end. Decoupling the two lets a
//! block freed at the tail retreat the cursor without asking the
//! provider to shrink — the provider only ever grows.

use crate::error::AllocError;
use crate::heap::HeapProvider;

/// Tracks the first address past the last block the allocator considers
/// in use. Invariant: `tail <= provider.hi() + 1`.
pub struct TailCursor {
  tail: *mut u8,
}

impl TailCursor {
  pub fn new(tail: *mut u8) -> Self {
    Self { tail }
  }

  pub fn get(&self) -> *mut u8 {
    self.tail
  }

  /// Retreats the cursor to `addr` without touching the provider. Used
  /// when a freed block sits flush against the tail.
  pub fn retreat_to(&mut self, addr: *mut u8) {
    self.tail = addr;
  }

  /// Grows the cursor by `n` bytes, pulling more memory from `heap` only
  /// if the provider's current high-water mark can't already cover it.
  /// Returns the tail's value *before* the grow — the base address of
  /// the newly claimed span.
  ///
  /// This is what makes repeated grow/retreat at the tail idempotent:
  /// the provider is only asked to grow when the cursor would otherwise
  /// outrun it, which after a retreat it usually won't.
  pub fn grow<H: HeapProvider>(&mut self, heap: &mut H, n: usize) -> Result<*mut u8, AllocError> {
    let old_tail = self.tail;
    let new_tail = unsafe { old_tail.add(n) };
    let provider_end = unsafe { heap.hi().add(1) };

    if (new_tail as usize) > (provider_end as usize) {
      let deficit = new_tail as usize - provider_end as usize;
      heap.grow(deficit).map_err(|_| AllocError::HeapExhausted)?;
    }

    self.tail = new_tail;
    Ok(old_tail)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::heap::MockHeap;

  #[test]
  fn grow_pulls_from_provider_only_when_needed() {
    let mut heap = MockHeap::with_capacity(256);
    heap.init();
    let base = heap.grow(64).unwrap();
    let mut tail = TailCursor::new(unsafe { heap.hi().add(1) });

    // Retreat to leave 32 bytes of slack before the provider's edge.
    tail.retreat_to(unsafe { base.add(32) });

    // Growing by 16 should not touch the provider at all.
    let before_size = heap.size();
    let old = tail.grow(&mut heap, 16).unwrap();
    assert_eq!(old, unsafe { base.add(32) });
    assert_eq!(heap.size(), before_size);

    // Growing past the provider's edge should pull exactly the deficit.
    let old2 = tail.grow(&mut heap, 64).unwrap();
    assert_eq!(old2, unsafe { base.add(48) });
    assert_eq!(heap.size(), before_size + 48);
  }

  #[test]
  fn grow_propagates_provider_exhaustion() {
    let mut heap = MockHeap::with_capacity(32);
    heap.init();
    heap.grow(32).unwrap();
    let mut tail = TailCursor::new(unsafe { heap.hi().add(1) });
    assert!(matches!(tail.grow(&mut heap, 1), Err(AllocError::HeapExhausted)));
  }
}
