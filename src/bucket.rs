use std::{
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use serde::Serialize;

/// Longest call stack we record per bucket. Deeper stacks are truncated.
pub const MAX_STACK_DEPTH: usize = 32;

/// Cumulative (de)allocation counters for one bucket, or for a whole table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
  pub alloc_bytes: u64,
  pub allocs: u64,
  pub free_bytes: u64,
  pub frees: u64,
}

impl Stats {
  #[must_use]
  pub fn in_use_allocs(&self) -> u64 {
    self.allocs.saturating_sub(self.frees)
  }

  #[must_use]
  pub fn in_use_bytes(&self) -> u64 {
    self.alloc_bytes.saturating_sub(self.free_bytes)
  }

  pub(crate) fn on_alloc(&mut self, bytes: u64) {
    self.allocs = self.allocs.saturating_add(1);
    self.alloc_bytes = self.alloc_bytes.saturating_add(bytes);
  }

  pub(crate) fn on_free(&mut self, bytes: u64) {
    self.frees = self.frees.saturating_add(1);
    self.free_bytes = self.free_bytes.saturating_add(bytes);
  }
}

pub(crate) fn bytes_u64(bytes: usize) -> u64 {
  u64::try_from(bytes).unwrap_or(u64::MAX)
}

/// Aggregate statistics for one distinct allocation call stack.
///
/// Identity is content equality of the frame sequence (depth included).
/// Buckets are owned by a [`BucketStore`] and live for the store's full
/// lifetime; allocation records and snapshots hold `Arc` references to them.
///
/// The counters are relaxed atomics so that shared handles can bump them
/// through `&self`; all mutation happens under the owner's external lock.
#[derive(Debug)]
pub struct Bucket {
  alloc_bytes: AtomicU64,
  allocs: AtomicU64,
  frames: Box<[usize]>,
  free_bytes: AtomicU64,
  frees: AtomicU64,
}

impl Bucket {
  #[must_use]
  pub fn depth(&self) -> usize {
    self.frames.len()
  }

  #[must_use]
  pub fn frames(&self) -> &[usize] {
    &self.frames
  }

  fn new(frames: &[usize]) -> Self {
    Self {
      alloc_bytes: AtomicU64::new(0),
      allocs: AtomicU64::new(0),
      frames: frames.into(),
      free_bytes: AtomicU64::new(0),
      frees: AtomicU64::new(0),
    }
  }

  pub(crate) fn record_alloc(&self, bytes: usize) {
    self.allocs.fetch_add(1, Ordering::Relaxed);
    self.alloc_bytes.fetch_add(bytes_u64(bytes), Ordering::Relaxed);
  }

  pub(crate) fn record_free(&self, bytes: usize) {
    self.frees.fetch_add(1, Ordering::Relaxed);
    self.free_bytes.fetch_add(bytes_u64(bytes), Ordering::Relaxed);
  }

  /// Read a consistent-enough copy of the counters.
  #[must_use]
  pub fn stats(&self) -> Stats {
    Stats {
      alloc_bytes: self.alloc_bytes.load(Ordering::Relaxed),
      allocs: self.allocs.load(Ordering::Relaxed),
      free_bytes: self.free_bytes.load(Ordering::Relaxed),
      frees: self.frees.load(Ordering::Relaxed),
    }
  }
}

/// Deduplicates call stacks into [`Bucket`]s keyed by frame content.
///
/// There is no removal operation; buckets persist until the store is
/// dropped. Not internally synchronized: callers serialize access with
/// the same external lock that guards the owning table.
#[derive(Debug, Default)]
pub struct BucketStore {
  buckets: HashMap<Box<[usize]>, Arc<Bucket>>,
}

impl BucketStore {
  /// Return the bucket for `frames`, creating it on first sight.
  ///
  /// Two stacks with identical frame sequences always resolve to the same
  /// bucket; any difference in depth or in a single frame value yields a
  /// distinct one. Stacks deeper than [`MAX_STACK_DEPTH`] are truncated
  /// before matching.
  pub fn get_or_create(&mut self, frames: &[usize]) -> Arc<Bucket> {
    let frames = &frames[..frames.len().min(MAX_STACK_DEPTH)];

    if let Some(existing) = self.buckets.get(frames) {
      return Arc::clone(existing);
    }

    let bucket = Arc::new(Bucket::new(frames));
    self.buckets.insert(frames.into(), Arc::clone(&bucket));
    bucket
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.buckets.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Arc<Bucket>> {
    self.buckets.values()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.buckets.len()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn identical_stacks_share_a_bucket() {
    let mut store = BucketStore::new();
    let first = store.get_or_create(&[0x10, 0x20]);
    let second = store.get_or_create(&[0x10, 0x20]);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(store.len(), 1);
  }

  #[test]
  fn depth_and_frame_differences_split_buckets() {
    let mut store = BucketStore::new();
    let base = store.get_or_create(&[0x10, 0x20]);
    let shorter = store.get_or_create(&[0x10]);
    let changed = store.get_or_create(&[0x10, 0x21]);

    assert!(!Arc::ptr_eq(&base, &shorter));
    assert!(!Arc::ptr_eq(&base, &changed));
    assert_eq!(store.len(), 3);
  }

  #[test]
  fn deep_stacks_are_truncated() {
    let mut store = BucketStore::new();
    let frames: Vec<usize> = (0..MAX_STACK_DEPTH + 8).collect();
    let bucket = store.get_or_create(&frames);

    assert_eq!(bucket.depth(), MAX_STACK_DEPTH);
    assert_eq!(bucket.frames(), &frames[..MAX_STACK_DEPTH]);

    // The truncated tail must not create a second bucket.
    let again = store.get_or_create(&frames[..MAX_STACK_DEPTH]);
    assert!(Arc::ptr_eq(&bucket, &again));
  }

  #[test]
  fn counters_accumulate_per_bucket() {
    let mut store = BucketStore::new();
    let bucket = store.get_or_create(&[0x1]);
    bucket.record_alloc(64);
    bucket.record_alloc(128);
    bucket.record_free(64);

    let stats = bucket.stats();
    assert_eq!(stats.allocs, 2);
    assert_eq!(stats.alloc_bytes, 192);
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.free_bytes, 64);
    assert_eq!(stats.in_use_allocs(), 1);
    assert_eq!(stats.in_use_bytes(), 128);
  }
}
