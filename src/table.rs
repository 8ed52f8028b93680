use std::{collections::HashMap, io, io::Write, sync::Arc};

use nohash_hasher::BuildNoHashHasher;

use crate::bucket::{Bucket, BucketStore, Stats, bytes_u64};
use crate::profile;
use crate::snapshot::Snapshot;

/// Address-keyed map of live allocations. Raw addresses already hash well,
/// so the identity hasher keeps point lookups cheap.
pub(crate) type AddressMap =
  HashMap<usize, AllocationRecord, BuildNoHashHasher<usize>>;

/// One tracked allocation: its size, owning bucket, and the two marking
/// flags used by leak checking.
#[derive(Debug, Clone)]
pub(crate) struct AllocationRecord {
  pub(crate) bucket: Arc<Bucket>,
  pub(crate) bytes: usize,
  pub(crate) ignore: bool,
  pub(crate) live: bool,
}

impl AllocationRecord {
  pub(crate) fn details(&self) -> AllocDetails {
    AllocDetails {
      bucket: Arc::clone(&self.bucket),
      bytes: self.bytes,
      ignored: self.ignore,
      live: self.live,
    }
  }
}

/// Everything we can say about one tracked allocation.
#[derive(Debug, Clone)]
pub struct AllocDetails {
  pub bucket: Arc<Bucket>,
  pub bytes: usize,
  pub ignored: bool,
  pub live: bool,
}

/// Tracks every currently-live allocation and attributes it to a call-stack
/// bucket.
///
/// Carries no internal synchronization: the surrounding allocator owns one
/// external lock that must serialize every call in here, including
/// iteration, against concurrent allocation traffic. The `&mut self`
/// receivers and the borrow on [`AllocationTable::allocs`] make most
/// violations of that contract fail to compile.
#[derive(Debug, Default)]
pub struct AllocationTable {
  buckets: BucketStore,
  map: AddressMap,
  total: Stats,
}

impl AllocationTable {
  /// Lazily iterate every tracked allocation with its derived info.
  ///
  /// The table cannot be mutated while the returned iterator is alive.
  pub fn allocs(&self) -> impl Iterator<Item = (usize, AllocDetails)> + '_ {
    self.map.iter().map(|(ptr, record)| (*ptr, record.details()))
  }

  pub fn buckets(&self) -> impl Iterator<Item = &Arc<Bucket>> {
    self.buckets.iter()
  }

  /// Exact-address lookup returning the allocation size.
  #[must_use]
  pub fn find_alloc(&self, ptr: usize) -> Option<usize> {
    self.map.get(&ptr).map(|record| record.bytes)
  }

  /// Exact-address lookup returning the full derived info.
  #[must_use]
  pub fn find_alloc_details(&self, ptr: usize) -> Option<AllocDetails> {
    self.map.get(&ptr).map(AllocationRecord::details)
  }

  /// Locate the allocation enclosing an arbitrary interior address.
  ///
  /// `max_size` bounds the largest allocation the caller considers
  /// plausible; anything bigger is skipped. Returns the allocation's start
  /// address and size.
  #[must_use]
  pub fn find_inside_alloc(
    &self,
    ptr: usize,
    max_size: usize,
  ) -> Option<(usize, usize)> {
    self.map.iter().find_map(|(&start, record)| {
      if record.bytes <= max_size
        && start <= ptr
        && ptr - start < record.bytes
      {
        Some((start, record.bytes))
      } else {
        None
      }
    })
  }

  /// Set the ignore flag on a tracked allocation.
  ///
  /// Ignored allocations remain tracked and counted but are excluded from
  /// leak reports. The flag is sticky until the allocation is freed.
  pub fn mark_as_ignored(&mut self, ptr: usize) {
    if let Some(record) = self.map.get_mut(&ptr) {
      record.ignore = true;
    }
  }

  /// Transition a tracked allocation's live flag from false to true.
  ///
  /// Returns whether a transition occurred: false if the allocation is
  /// already live or not tracked at all. All allocations start non-live.
  pub fn mark_as_live(&mut self, ptr: usize) -> bool {
    match self.map.get_mut(&ptr) {
      Some(record) if !record.live => {
        record.live = true;
        true
      }
      _ => false,
    }
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Snapshot every allocation that is not ignored, not live, and (when
  /// `base` is given) not present in `base`.
  ///
  /// As a side effect, clears the live flag on every record in the table,
  /// establishing a fresh liveness epoch for the next heap walk. This is
  /// the leak-detection primitive: a heap walker marks every reachable
  /// address live, then this call returns everything unreachable.
  pub fn non_live_snapshot(&mut self, base: Option<&Snapshot>) -> Snapshot {
    let mut snapshot = Snapshot::new();

    for (&ptr, record) in &self.map {
      if record.ignore || record.live {
        continue;
      }
      if base.is_some_and(|base| base.contains(ptr)) {
        continue;
      }
      snapshot.add(ptr, record.clone());
    }

    for record in self.map.values_mut() {
      record.live = false;
    }

    snapshot
  }

  /// Record an allocation of `bytes` bytes at `ptr`, attributed to the
  /// call stack `frames`.
  ///
  /// Calling this again for an address still tracked is a caller contract
  /// violation: the old record is replaced without attributing a free, so
  /// the attribution becomes undefined. Callers must free first.
  pub fn record_alloc(&mut self, ptr: usize, bytes: usize, frames: &[usize]) {
    let bucket = self.buckets.get_or_create(frames);
    bucket.record_alloc(bytes);
    self.total.on_alloc(bytes_u64(bytes));

    self.map.insert(
      ptr,
      AllocationRecord {
        bucket,
        bytes,
        ignore: false,
        live: false,
      },
    );
  }

  /// Record the deallocation of the memory at `ptr`.
  ///
  /// Freeing an address the table never tracked is a no-op; it tolerates
  /// frees of allocations made before tracking started.
  pub fn record_free(&mut self, ptr: usize) {
    if let Some(record) = self.map.remove(&ptr) {
      record.bucket.record_free(record.bytes);
      self.total.on_free(bytes_u64(record.bytes));
    }
  }

  /// Drop a snapshot taken from this table.
  ///
  /// Only the snapshot's private map is freed; the buckets it references
  /// are shared with this table and untouched.
  pub fn release_snapshot(&self, snapshot: Snapshot) {
    drop(snapshot);
  }

  /// Serialize the total and every bucket's stack and stats to `writer`
  /// in the bucket-record profile format.
  ///
  /// # Errors
  ///
  /// Returns an error if the downstream writer reports a failure.
  pub fn save_profile<W: Write>(&self, writer: &mut W) -> io::Result<()> {
    profile::write_profile(
      writer,
      &self.total,
      self
        .buckets
        .iter()
        .map(|bucket| (bucket.stats(), bucket.frames())),
    )
  }

  /// Serialize the same profile contents as a single JSON object.
  ///
  /// # Errors
  ///
  /// Returns an error if JSON encoding fails or the writer reports a
  /// failure.
  pub fn save_profile_json<W: Write>(
    &self,
    writer: W,
  ) -> Result<(), profile::ProfileError> {
    profile::write_profile_json(
      writer,
      &self.total,
      self
        .buckets
        .iter()
        .map(|bucket| (bucket.stats(), bucket.frames())),
    )
  }

  /// Copy the current address map and running total into a new snapshot.
  ///
  /// The snapshot shares the bucket references; it must not outlive this
  /// table's usefulness as their owner.
  #[must_use]
  pub fn take_snapshot(&self) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for (&ptr, record) in &self.map {
      snapshot.add(ptr, record.clone());
    }
    snapshot
  }

  /// Current table-wide (de)allocation totals.
  #[must_use]
  pub fn total(&self) -> &Stats {
    &self.total
  }

  #[must_use]
  pub fn tracked(&self) -> usize {
    self.map.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const STACK_AB: [usize; 2] = [0xa000, 0xb000];
  const STACK_C: [usize; 1] = [0xc000];

  #[test]
  fn identical_stacks_resolve_to_one_bucket() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    table.record_alloc(0x2000, 128, &STACK_AB);

    let buckets: Vec<_> = table.buckets().collect();
    assert_eq!(buckets.len(), 1);

    let stats = buckets[0].stats();
    assert_eq!(stats.allocs, 2);
    assert_eq!(stats.alloc_bytes, 192);

    assert_eq!(table.find_alloc(0x1000), Some(64));
  }

  #[test]
  fn totals_match_replayed_history() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    table.record_alloc(0x2000, 128, &STACK_C);
    table.record_alloc(0x3000, 32, &STACK_AB);
    table.record_free(0x2000);

    let total = table.total();
    assert_eq!(total.in_use_allocs(), 2);
    assert_eq!(total.in_use_bytes(), 96);
    assert_eq!(table.tracked(), 2);

    // The table-wide total always equals the net of per-bucket accounting.
    let mut net_allocs = 0;
    let mut net_bytes = 0;
    for bucket in table.buckets() {
      let stats = bucket.stats();
      net_allocs += stats.in_use_allocs();
      net_bytes += stats.in_use_bytes();
    }
    assert_eq!(net_allocs, total.in_use_allocs());
    assert_eq!(net_bytes, total.in_use_bytes());
  }

  #[test]
  fn free_attributes_to_the_owning_bucket() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    table.record_free(0x1000);

    let bucket = table.buckets().next().expect("bucket should persist");
    let stats = bucket.stats();
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.free_bytes, 64);
    assert_eq!(table.find_alloc(0x1000), None);
  }

  #[test]
  fn freeing_an_untracked_address_is_a_noop() {
    let mut table = AllocationTable::new();
    table.record_free(0xdead);

    assert_eq!(*table.total(), Stats::default());
    assert_eq!(table.tracked(), 0);
  }

  #[test]
  fn mark_as_live_is_a_one_shot_transition() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);

    assert!(table.mark_as_live(0x1000));
    assert!(!table.mark_as_live(0x1000));
    assert!(!table.mark_as_live(0x9999));
  }

  #[test]
  fn details_reflect_marking() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);

    let details = table.find_alloc_details(0x1000).expect("tracked");
    assert!(!details.live);
    assert!(!details.ignored);
    assert_eq!(details.bucket.frames(), &STACK_AB);

    table.mark_as_live(0x1000);
    table.mark_as_ignored(0x1000);

    let details = table.find_alloc_details(0x1000).expect("tracked");
    assert!(details.live);
    assert!(details.ignored);
  }

  #[test]
  fn find_inside_alloc_honors_bounds() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);

    assert_eq!(table.find_inside_alloc(0x1000, 1024), Some((0x1000, 64)));
    assert_eq!(table.find_inside_alloc(0x103f, 1024), Some((0x1000, 64)));
    assert_eq!(table.find_inside_alloc(0x1040, 1024), None);
    assert_eq!(table.find_inside_alloc(0x0fff, 1024), None);
    // Allocations larger than max_size are not considered.
    assert_eq!(table.find_inside_alloc(0x1010, 32), None);
  }

  #[test]
  fn non_live_snapshot_diffs_and_resets_liveness() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    table.record_alloc(0x2000, 128, &STACK_AB);
    table.record_alloc(0x3000, 16, &STACK_C);
    table.mark_as_ignored(0x3000);
    table.mark_as_live(0x1000);

    let leaks = table.non_live_snapshot(None);
    assert!(!leaks.contains(0x1000)); // live
    assert!(leaks.contains(0x2000));
    assert!(!leaks.contains(0x3000)); // ignored
    assert_eq!(leaks.total().allocs, 1);
    assert_eq!(leaks.total().alloc_bytes, 128);

    // The side effect cleared every live flag, so marking again transitions.
    assert!(table.mark_as_live(0x1000));
  }

  #[test]
  fn non_live_snapshot_skips_addresses_in_base() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    let base = table.non_live_snapshot(None);

    table.record_alloc(0x2000, 128, &STACK_AB);
    let fresh = table.non_live_snapshot(Some(&base));

    assert!(!fresh.contains(0x1000));
    assert!(fresh.contains(0x2000));
    table.release_snapshot(base);
    table.release_snapshot(fresh);
  }

  #[test]
  fn releasing_a_snapshot_leaves_the_parent_intact() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    let snapshot = table.take_snapshot();
    table.release_snapshot(snapshot);

    assert_eq!(table.find_alloc(0x1000), Some(64));
    let bucket = table.buckets().next().expect("bucket survives release");
    assert_eq!(bucket.stats().allocs, 1);
  }

  #[test]
  fn iteration_visits_every_record() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    table.record_alloc(0x2000, 128, &STACK_C);

    let mut seen: Vec<_> =
      table.allocs().map(|(ptr, info)| (ptr, info.bytes)).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![(0x1000, 64), (0x2000, 128)]);
  }

  #[test]
  fn json_profile_carries_total_and_buckets() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);

    let mut out = Vec::new();
    table.save_profile_json(&mut out).expect("json encodes");
    let value: serde_json::Value =
      serde_json::from_slice(&out).expect("json parses");

    assert_eq!(value["total"]["alloc_bytes"], 64);
    assert_eq!(value["buckets"][0]["frames"][0], 0xa000);
  }

  #[test]
  fn save_profile_emits_header_and_buckets() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &STACK_AB);
    table.record_alloc(0x2000, 128, &STACK_AB);
    table.record_free(0x1000);

    let mut out = Vec::new();
    table.save_profile(&mut out).expect("write to vec");
    let text = String::from_utf8(out).expect("utf-8 profile");

    assert!(text.starts_with("heap profile:"));
    assert!(text.contains("1: 128 [2: 192] @ 0xa000 0xb000"));
  }
}
