use std::{
  collections::HashMap,
  fs::File,
  io,
  io::{BufWriter, Write},
  path::Path,
  sync::Arc,
};

use log::{error, info};

use crate::bucket::{Bucket, Stats, bytes_u64};
use crate::profile;
use crate::table::{AddressMap, AllocationRecord};

/// Immutable point-in-time view of an allocation table, used for leak
/// diffing and reporting.
///
/// The snapshot owns its private address map but shares the buckets with
/// the parent table; dropping a snapshot never touches them. It borrows
/// meaning from the parent and should not be kept past the table's life.
#[derive(Debug, Default)]
pub struct Snapshot {
  map: AddressMap,
  total: Stats,
}

impl Snapshot {
  pub(crate) fn add(&mut self, ptr: usize, record: AllocationRecord) {
    self.total.allocs = self.total.allocs.saturating_add(1);
    self.total.alloc_bytes =
      self.total.alloc_bytes.saturating_add(bytes_u64(record.bytes));
    self.map.insert(ptr, record);
  }

  #[must_use]
  pub fn contains(&self, ptr: usize) -> bool {
    self.map.contains_key(&ptr)
  }

  /// True iff the snapshot holds no allocations and no bytes.
  #[must_use]
  pub fn empty(&self) -> bool {
    self.total.allocs == 0 && self.total.alloc_bytes == 0
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.map.len()
  }

  #[must_use]
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Write every entry's address, size, and raw stack to `out`,
  /// unsymbolized.
  ///
  /// # Errors
  ///
  /// Returns an error if the downstream writer reports a failure.
  pub fn report_individual_objects<W: Write>(
    &self,
    out: &mut W,
  ) -> io::Result<()> {
    for (ptr, record) in &self.map {
      write!(out, "{ptr:#x} of {} bytes from:", record.bytes)?;
      for pc in record.bucket.frames() {
        write!(out, " {pc:#x}")?;
      }
      writeln!(out)?;
    }
    Ok(())
  }

  /// Report everything in this snapshot as a leak.
  ///
  /// Writes a profile in the bucket-record format to `path` covering the
  /// snapshot's contents, and logs one leak line per distinct call stack.
  /// With `should_symbolize`, frame addresses are resolved to symbol names
  /// in-process. The snapshot is read-only throughout.
  ///
  /// # Errors
  ///
  /// Returns an error if the profile file cannot be created or written.
  pub fn report_leaks(
    &self,
    checker_name: &str,
    path: &Path,
    should_symbolize: bool,
  ) -> io::Result<()> {
    let groups = self.group_by_bucket();

    let mut writer = BufWriter::new(File::create(path)?);
    profile::write_profile(
      &mut writer,
      &self.total,
      groups.iter().map(|(bucket, stats)| (*stats, bucket.frames())),
    )?;
    writer.flush()?;

    for (bucket, stats) in &groups {
      error!(
        "Leak of {} bytes in {} objects allocated from:",
        stats.alloc_bytes, stats.allocs
      );
      for &pc in bucket.frames() {
        if should_symbolize {
          error!("\t@ {pc:#x} {}", symbolize_pc(pc));
        } else {
          error!("\t@ {pc:#x}");
        }
      }
    }

    info!(
      "{checker_name} detected leaks of {} bytes in {} objects",
      self.total.alloc_bytes, self.total.allocs
    );

    Ok(())
  }

  #[must_use]
  pub fn total(&self) -> &Stats {
    &self.total
  }

  /// Coalesce the entries per distinct bucket, largest leak first.
  fn group_by_bucket(&self) -> Vec<(Arc<Bucket>, Stats)> {
    let mut groups: HashMap<usize, (Arc<Bucket>, Stats)> = HashMap::new();

    for record in self.map.values() {
      let key = Arc::as_ptr(&record.bucket) as usize;
      let entry = groups
        .entry(key)
        .or_insert_with(|| (Arc::clone(&record.bucket), Stats::default()));
      entry.1.allocs = entry.1.allocs.saturating_add(1);
      entry.1.alloc_bytes =
        entry.1.alloc_bytes.saturating_add(bytes_u64(record.bytes));
    }

    let mut groups: Vec<_> = groups.into_values().collect();
    groups.sort_by(|a, b| b.1.alloc_bytes.cmp(&a.1.alloc_bytes));
    groups
  }
}

/// Resolve one program counter to a symbol name, in-process.
fn symbolize_pc(pc: usize) -> String {
  let mut resolved = None;

  backtrace::resolve(pc as *mut std::ffi::c_void, |symbol| {
    if resolved.is_none() {
      resolved = symbol.name().map(|name| name.to_string());
    }
  });

  resolved.unwrap_or_else(|| "<unknown>".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::table::AllocationTable;

  fn temp_path(name: &str) -> std::path::PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("stacktally-{}-{name}", std::process::id()));
    path
  }

  #[test]
  fn empty_snapshot_reports_empty() {
    let table = AllocationTable::new();
    let snapshot = table.take_snapshot();
    assert!(snapshot.empty());
    assert_eq!(snapshot.len(), 0);
  }

  #[test]
  fn snapshot_total_matches_copied_entries() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &[0xa]);
    table.record_alloc(0x2000, 128, &[0xb]);

    let snapshot = table.take_snapshot();
    assert_eq!(snapshot.total().allocs, 2);
    assert_eq!(snapshot.total().alloc_bytes, 192);
    assert!(snapshot.contains(0x1000));
    assert!(snapshot.contains(0x2000));
  }

  #[test]
  fn report_leaks_writes_the_profile_file() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &[0xa, 0xb]);
    table.record_alloc(0x2000, 32, &[0xa, 0xb]);

    let snapshot = table.take_snapshot();
    let path = temp_path("leaks.heap");
    snapshot
      .report_leaks("test-checker", &path, false)
      .expect("leak report written");

    let text = std::fs::read_to_string(&path).expect("profile readable");
    assert!(text.starts_with("heap profile:"));
    assert!(text.contains("2: 96 [2: 96] @ 0xa 0xb"));

    std::fs::remove_file(&path).ok();
  }

  #[test]
  fn individual_objects_list_address_size_and_stack() {
    let mut table = AllocationTable::new();
    table.record_alloc(0x1000, 64, &[0xa, 0xb]);

    let snapshot = table.take_snapshot();
    let mut out = Vec::new();
    snapshot
      .report_individual_objects(&mut out)
      .expect("write to vec");
    let text = String::from_utf8(out).expect("utf-8 report");

    assert_eq!(text, "0x1000 of 64 bytes from: 0xa 0xb\n");
  }
}
