use std::ptr::NonNull;

use bumpalo::Bump;

use crate::bucket::MAX_STACK_DEPTH;

/// One raw sampled stack trace captured at an allocation site.
#[derive(Debug, Clone, Copy)]
pub struct SampledTrace {
  depth: usize,
  frames: [usize; MAX_STACK_DEPTH],
  size: usize,
}

impl SampledTrace {
  #[must_use]
  pub fn depth(&self) -> usize {
    self.depth
  }

  #[must_use]
  pub fn frames(&self) -> &[usize] {
    &self.frames[..self.depth]
  }

  #[must_use]
  pub fn new(size: usize, frames: &[usize]) -> Self {
    let depth = frames.len().min(MAX_STACK_DEPTH);
    let mut buf = [0usize; MAX_STACK_DEPTH];
    buf[..depth].copy_from_slice(&frames[..depth]);

    Self {
      depth,
      frames: buf,
      size,
    }
  }

  #[must_use]
  pub fn size(&self) -> usize {
    self.size
  }
}

struct TraceEntry {
  next: Option<NonNull<TraceEntry>>,
  trace: SampledTrace,
}

/// Accumulates sampled allocation-site traces with allocation-safe
/// bookkeeping.
///
/// Entries live in a dedicated arena and are linked through an intrusive
/// forward list, so accumulation never calls into the general allocator
/// and can run while the allocator's internal lock is held. The two
/// operations have asymmetric locking preconditions; violating either
/// direction is a correctness bug, not a performance one.
pub struct TraceCoalescer {
  arena: Bump,
  head: Option<NonNull<TraceEntry>>,
  len: usize,
}

// The raw links only ever point into the owned arena.
unsafe impl Send for TraceCoalescer {}

impl Default for TraceCoalescer {
  fn default() -> Self {
    Self::new()
  }
}

impl TraceCoalescer {
  /// Record one sampled trace.
  ///
  /// Caller must hold the allocator's internal lock. The entry is copied
  /// into the coalescer's arena and pushed to the front of the list; the
  /// general allocator is never touched.
  pub fn add_trace(&mut self, trace: &SampledTrace) {
    let entry = self.arena.alloc(TraceEntry {
      next: self.head,
      trace: *trace,
    });

    self.head = Some(NonNull::from(entry));
    self.len += 1;
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.len
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      arena: Bump::new(),
      head: None,
      len: 0,
    }
  }

  /// Flatten every accumulated trace into one machine-word dump and reset.
  ///
  /// Caller must NOT hold the allocator's internal lock: the output buffer
  /// comes from the general allocator, and holding that lock here risks
  /// deadlock or unsafe reentry.
  ///
  /// Each trace is emitted as `[count, size, depth, frames...]` with
  /// `count` always 1, most recent trace first; the dump ends with a
  /// single 0 word. Returns `None` if the output buffer cannot be
  /// allocated, in which case the accumulated samples are dropped rather
  /// than retried. The list and arena are emptied either way.
  pub fn read_stack_traces_and_clear(&mut self) -> Option<Box<[usize]>> {
    let mut words = 1; // terminator
    self.walk(|trace| words += 3 + trace.depth());

    let mut out = Vec::new();
    if out.try_reserve_exact(words).is_err() {
      self.clear();
      return None;
    }

    self.walk(|trace| {
      out.push(1);
      out.push(trace.size());
      out.push(trace.depth());
      out.extend_from_slice(trace.frames());
    });
    out.push(0);

    self.clear();
    Some(out.into_boxed_slice())
  }

  fn clear(&mut self) {
    self.head = None;
    self.len = 0;
    self.arena.reset();
  }

  fn walk(&self, mut visit: impl FnMut(&SampledTrace)) {
    let mut cursor = self.head;
    while let Some(ptr) = cursor {
      // SAFETY: entries are allocated from `arena`, and the list head is
      // cleared before the arena is ever reset, so `ptr` is live here.
      let entry = unsafe { ptr.as_ref() };
      visit(&entry.trace);
      cursor = entry.next;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(dump: &[usize]) -> Vec<(usize, Vec<usize>)> {
    let mut traces = Vec::new();
    let mut i = 0;
    while dump[i] != 0 {
      assert_eq!(dump[i], 1, "per-trace count is always 1");
      let size = dump[i + 1];
      let depth = dump[i + 2];
      traces.push((size, dump[i + 3..i + 3 + depth].to_vec()));
      i += 3 + depth;
    }
    assert_eq!(i + 1, dump.len(), "dump ends at the terminator");
    traces
  }

  #[test]
  fn drains_accumulated_traces_once() {
    let mut coalescer = TraceCoalescer::new();
    coalescer.add_trace(&SampledTrace::new(64, &[0xa, 0xb]));
    coalescer.add_trace(&SampledTrace::new(128, &[0xc]));
    assert_eq!(coalescer.len(), 2);

    let dump = coalescer
      .read_stack_traces_and_clear()
      .expect("dump allocates");
    let traces = parse(&dump);

    // Most recent first: entries are pushed to the front of the list.
    assert_eq!(traces, vec![(128, vec![0xc]), (64, vec![0xa, 0xb])]);
    assert!(coalescer.is_empty());
  }

  #[test]
  fn second_drain_is_empty() {
    let mut coalescer = TraceCoalescer::new();
    coalescer.add_trace(&SampledTrace::new(8, &[0x1]));
    let _ = coalescer.read_stack_traces_and_clear();

    let dump = coalescer
      .read_stack_traces_and_clear()
      .expect("empty dump still allocates");
    assert!(parse(&dump).is_empty());
  }

  #[test]
  fn traces_deeper_than_the_limit_are_truncated() {
    let frames: Vec<usize> = (1..=MAX_STACK_DEPTH + 4).collect();
    let trace = SampledTrace::new(16, &frames);

    assert_eq!(trace.depth(), MAX_STACK_DEPTH);
    assert_eq!(trace.frames(), &frames[..MAX_STACK_DEPTH]);
  }
}
