use std::{
  fmt,
  fmt::{Display, Formatter},
  fs, io,
  io::Write,
  path::Path,
};

use log::info;
use serde::Serialize;

use crate::bucket::Stats;

/// Extension used for profile files.
pub const PROFILE_FILE_EXT: &str = ".heap";

/// Errors that can occur while exporting a profile.
#[derive(Debug)]
pub enum ProfileError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ProfileError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during profile export: {err}"),
      Self::Json(err) => write!(f, "failed to encode profile as json: {err}"),
    }
  }
}

impl std::error::Error for ProfileError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ProfileError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ProfileError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Remove stale profile files matching `prefix + ".*" + PROFILE_FILE_EXT`.
///
/// Returns the number of files removed.
///
/// # Errors
///
/// Returns an error if the directory holding `prefix` cannot be read or a
/// matching file cannot be removed.
pub fn cleanup_old_profiles(prefix: &Path) -> io::Result<usize> {
  let dir = match prefix.parent() {
    Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
    Some(parent) => parent,
    None => Path::new("."),
  };
  let Some(stem) = prefix.file_name().and_then(|name| name.to_str()) else {
    return Ok(0);
  };
  let lead = format!("{stem}.");

  let mut removed = 0;
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    let name = entry.file_name();
    let Some(name) = name.to_str() else {
      continue;
    };

    if name.starts_with(&lead)
      && name.ends_with(PROFILE_FILE_EXT)
      && name.len() >= lead.len() + PROFILE_FILE_EXT.len()
    {
      fs::remove_file(entry.path())?;
      info!("removed old profile {}", entry.path().display());
      removed += 1;
    }
  }

  Ok(removed)
}

/// Write one bucket record: counts, byte totals, and the raw frames.
fn write_bucket<W: Write>(
  writer: &mut W,
  stats: &Stats,
  frames: &[usize],
  extra: &str,
) -> io::Result<()> {
  write!(
    writer,
    "{}: {} [{}: {}] @",
    stats.in_use_allocs(),
    stats.in_use_bytes(),
    stats.allocs,
    stats.alloc_bytes,
  )?;
  for &pc in frames {
    write!(writer, " {pc:#x}")?;
  }
  writeln!(writer, "{extra}")?;
  Ok(())
}

/// Serialize a profile as a header carrying the total, followed by one
/// record per bucket.
///
/// # Errors
///
/// Returns an error if the downstream writer reports a failure.
pub fn write_profile<'a, W, I>(
  writer: &mut W,
  total: &Stats,
  buckets: I,
) -> io::Result<()>
where
  W: Write,
  I: Iterator<Item = (Stats, &'a [usize])>,
{
  write!(
    writer,
    "heap profile: {}: {} [{}: {}] @",
    total.in_use_allocs(),
    total.in_use_bytes(),
    total.allocs,
    total.alloc_bytes,
  )?;
  writeln!(writer, " heapprofile")?;

  for (stats, frames) in buckets {
    write_bucket(writer, &stats, frames, "")?;
  }

  Ok(())
}

#[derive(Serialize)]
struct BucketDump<'a> {
  frames: &'a [usize],
  stats: Stats,
}

#[derive(Serialize)]
struct ProfileDump<'a> {
  buckets: Vec<BucketDump<'a>>,
  total: Stats,
}

/// Serialize the same profile contents as a single JSON object.
///
/// # Errors
///
/// Returns an error if JSON encoding fails or the writer reports a failure.
pub fn write_profile_json<'a, W, I>(
  writer: W,
  total: &Stats,
  buckets: I,
) -> Result<(), ProfileError>
where
  W: Write,
  I: Iterator<Item = (Stats, &'a [usize])>,
{
  let dump = ProfileDump {
    buckets: buckets
      .map(|(stats, frames)| BucketDump { frames, stats })
      .collect(),
    total: *total,
  };
  serde_json::to_writer(writer, &dump)?;
  Ok(())
}
