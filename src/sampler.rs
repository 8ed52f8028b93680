use std::{
  fmt,
  fmt::{Display, Formatter},
  fs::File,
  io,
  io::{BufWriter, Write},
  path::{Path, PathBuf},
  sync::{
    Arc, Condvar, Mutex, MutexGuard,
    atomic::{AtomicUsize, Ordering},
  },
  thread,
  thread::JoinHandle,
  time::{Duration, SystemTime},
};

use log::{error, info, warn};

use crate::bucket::{BucketStore, MAX_STACK_DEPTH, Stats};
use crate::config::{ConfigError, ProfileEnv};
use crate::profile;

/// Sampling frequency used when the platform does not dictate one.
pub const DEFAULT_FREQUENCY_HZ: u32 = 100;

/// Innermost frames belonging to the sampling plumbing itself (the capture
/// closure, the capture helper, and the timer loop). They are artifacts of
/// profiling and are not measured.
const SAMPLER_SKIP_FRAMES: usize = 3;

/// How often the toggle watcher checks for a pending signal.
const TOGGLE_POLL: Duration = Duration::from_millis(20);

/// Errors from sampler control operations and profiler initialization.
#[derive(Debug)]
pub enum SamplerError {
  /// `start` was called while sampling is already enabled. No side
  /// effects were taken.
  AlreadyEnabled,
  Config(ConfigError),
  Io(io::Error),
  /// The toggle signal already has a handler installed by someone else.
  SignalInUse(i32),
}

impl Display for SamplerError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::AlreadyEnabled => write!(f, "sampler is already enabled"),
      Self::Config(err) => write!(f, "{err}"),
      Self::Io(err) => write!(f, "i/o error in sampler: {err}"),
      Self::SignalInUse(signum) => {
        write!(f, "signal {signum} already has a handler installed")
      }
    }
  }
}

impl std::error::Error for SamplerError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Config(err) => Some(err),
      Self::Io(err) => Some(err),
      _ => None,
    }
  }
}

impl From<ConfigError> for SamplerError {
  fn from(value: ConfigError) -> Self {
    Self::Config(value)
  }
}

impl From<io::Error> for SamplerError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

/// Read-only view of a collector's state.
#[derive(Debug, Clone)]
pub struct CollectorState {
  pub enabled: bool,
  pub profile_path: PathBuf,
  pub samples_gathered: u64,
  pub start_time: SystemTime,
}

/// External stack-trace collector driven by the sampler.
///
/// `add` is called only from the sampling thread; the sampler guarantees
/// the thread is drained before any other collector method runs, so
/// implementations need no extra coordination between `add` and the
/// control operations.
pub trait Collector: Send + Sync {
  /// Record one captured stack.
  fn add(&self, frames: &[usize]);

  fn enabled(&self) -> bool;

  /// Write accumulated data without stopping collection.
  ///
  /// # Errors
  ///
  /// Returns an error if the output cannot be written.
  fn flush(&self) -> io::Result<()>;

  /// Begin collecting to `path` at the given sampling frequency.
  ///
  /// # Errors
  ///
  /// Returns an error if collection is already running or the output
  /// cannot be prepared.
  fn start(&self, path: &Path, frequency_hz: u32) -> io::Result<()>;

  fn state(&self) -> CollectorState;

  /// Stop collecting and write accumulated data to disk.
  ///
  /// # Errors
  ///
  /// Returns an error if the output cannot be written.
  fn stop(&self) -> io::Result<()>;
}

#[derive(Debug)]
struct BucketCollectorInner {
  buckets: BucketStore,
  enabled: bool,
  path: PathBuf,
  samples: u64,
  start_time: SystemTime,
  total: Stats,
}

impl BucketCollectorInner {
  fn write_file(&self) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(&self.path)?);
    profile::write_profile(
      &mut writer,
      &self.total,
      self
        .buckets
        .iter()
        .map(|bucket| (bucket.stats(), bucket.frames())),
    )?;
    writer.flush()
  }
}

/// Collector that deduplicates sampled stacks through a [`BucketStore`]
/// and writes the bucket-record format on stop and flush. Sample hits are
/// carried in the allocation-count column; the byte columns stay zero.
#[derive(Debug)]
pub struct BucketCollector {
  inner: Mutex<BucketCollectorInner>,
}

impl Default for BucketCollector {
  fn default() -> Self {
    Self::new()
  }
}

impl BucketCollector {
  #[must_use]
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(BucketCollectorInner {
        buckets: BucketStore::new(),
        enabled: false,
        path: PathBuf::new(),
        samples: 0,
        start_time: SystemTime::UNIX_EPOCH,
        total: Stats::default(),
      }),
    }
  }
}

impl Collector for BucketCollector {
  fn add(&self, frames: &[usize]) {
    let mut inner = lock_recover(&self.inner);
    if !inner.enabled {
      return;
    }

    inner.buckets.get_or_create(frames).record_alloc(0);
    inner.total.on_alloc(0);
    inner.samples += 1;
  }

  fn enabled(&self) -> bool {
    lock_recover(&self.inner).enabled
  }

  fn flush(&self) -> io::Result<()> {
    let inner = lock_recover(&self.inner);
    if !inner.enabled {
      return Ok(());
    }
    inner.write_file()
  }

  fn start(&self, path: &Path, frequency_hz: u32) -> io::Result<()> {
    let mut inner = lock_recover(&self.inner);
    if inner.enabled {
      return Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "collector is already running",
      ));
    }

    *inner = BucketCollectorInner {
      buckets: BucketStore::new(),
      enabled: true,
      path: path.to_path_buf(),
      samples: 0,
      start_time: SystemTime::now(),
      total: Stats::default(),
    };
    info!("sampling at {frequency_hz} Hz to {}", path.display());
    Ok(())
  }

  fn state(&self) -> CollectorState {
    let inner = lock_recover(&self.inner);
    CollectorState {
      enabled: inner.enabled,
      profile_path: inner.path.clone(),
      samples_gathered: inner.samples,
      start_time: inner.start_time,
    }
  }

  fn stop(&self) -> io::Result<()> {
    let mut inner = lock_recover(&self.inner);
    if !inner.enabled {
      return Ok(());
    }

    let result = inner.write_file();
    inner.enabled = false;
    info!(
      "wrote {} samples to {}",
      inner.samples,
      inner.path.display()
    );
    result
  }
}

/// Capture a bounded-depth raw stack trace, usable outside the sampling
/// path.
///
/// `skip` gives the number of innermost frames to drop (profiling
/// plumbing between the caller and the capture). A spurious duplicate of
/// the topmost frame, as produced by non-frame-pointer-based unwinding,
/// is deduplicated.
#[must_use]
pub fn capture_stack(skip: usize) -> Vec<usize> {
  let mut frames = Vec::with_capacity(MAX_STACK_DEPTH);
  let mut remaining_skip = skip;

  backtrace::trace(|frame| {
    if remaining_skip > 0 {
      remaining_skip -= 1;
      return true;
    }
    if frames.len() >= MAX_STACK_DEPTH {
      return false;
    }
    frames.push(frame.ip() as usize);
    true
  });

  if frames.len() >= 2 && frames[0] == frames[1] {
    frames.remove(0);
  }

  frames
}

/// Per-sample filter predicate, evaluated on the sampling thread.
pub type SampleFilter = Arc<dyn Fn() -> bool + Send + Sync>;

/// Options accepted by [`Sampler::start`].
#[derive(Clone)]
pub struct SamplerOptions {
  /// Include a sample only when the predicate returns true. `None` keeps
  /// every sample.
  pub filter: Option<SampleFilter>,
  pub frequency_hz: u32,
}

impl fmt::Debug for SamplerOptions {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    f.debug_struct("SamplerOptions")
      .field("filter", &self.filter.is_some())
      .field("frequency_hz", &self.frequency_hz)
      .finish()
  }
}

impl Default for SamplerOptions {
  fn default() -> Self {
    Self {
      filter: None,
      frequency_hz: DEFAULT_FREQUENCY_HZ,
    }
  }
}

#[derive(Default)]
struct WorkerShared {
  cond: Condvar,
  stop: Mutex<bool>,
}

struct Worker {
  handle: JoinHandle<()>,
  shared: Arc<WorkerShared>,
}

impl Worker {
  fn spawn(
    collector: Arc<dyn Collector>,
    filter: Option<SampleFilter>,
    period: Duration,
  ) -> io::Result<Self> {
    let shared = Arc::new(WorkerShared::default());
    let thread_shared = Arc::clone(&shared);

    let handle = thread::Builder::new()
      .name("stacktally-sampler".into())
      .spawn(move || {
        run_sampling_loop(&thread_shared, &*collector, filter.as_ref(), period);
      })?;

    Ok(Self { handle, shared })
  }

  /// Stop the sampling thread and wait for it to finish.
  ///
  /// Once this returns, no further capture will ever run and any
  /// in-progress one has fully completed. This drain is the entire
  /// concurrency contract protecting the collector from racing with
  /// control operations.
  fn stop_and_join(self) {
    *lock_recover(&self.shared.stop) = true;
    self.shared.cond.notify_all();
    if self.handle.join().is_err() {
      warn!("sampling thread panicked during shutdown");
    }
  }
}

/// The capture path. Runs outside the sampler's control lock; there is at
/// most one invocation in flight because this is the only thread calling
/// `Collector::add`.
fn run_sampling_loop(
  shared: &WorkerShared,
  collector: &dyn Collector,
  filter: Option<&SampleFilter>,
  period: Duration,
) {
  let mut stop = lock_recover(&shared.stop);

  loop {
    let (guard, wait) = match shared.cond.wait_timeout(stop, period) {
      Ok(pair) => pair,
      Err(err) => err.into_inner(),
    };
    stop = guard;

    if *stop {
      break;
    }
    if !wait.timed_out() {
      continue;
    }
    if filter.is_some_and(|filter| !filter()) {
      continue;
    }

    let frames = capture_stack(SAMPLER_SKIP_FRAMES);
    if !frames.is_empty() {
      collector.add(&frames);
    }
  }
}

struct SamplerInner {
  filter: Option<SampleFilter>,
  period: Duration,
  worker: Option<Worker>,
}

/// Periodically samples the program's stack from a dedicated timer thread
/// and forwards captured stacks to a [`Collector`].
///
/// One mutex serializes all control operations. The capture path runs on
/// the timer thread outside that lock; disabling the thread joins it, so
/// once `stop` or `flush_table` has detached the worker there is no
/// capture in flight and the collector can be touched safely.
pub struct Sampler {
  collector: Arc<dyn Collector>,
  inner: Mutex<SamplerInner>,
}

impl Sampler {
  /// Read-only query of the collector's current state.
  #[must_use]
  pub fn current_state(&self) -> CollectorState {
    let _inner = self.lock_inner();
    self.collector.state()
  }

  #[must_use]
  pub fn enabled(&self) -> bool {
    let inner = self.lock_inner();
    inner.worker.is_some() && self.collector.enabled()
  }

  /// Write accumulated data to disk without stopping sampling.
  ///
  /// A silent no-op when sampling is disabled.
  pub fn flush_table(&self) {
    let mut inner = self.lock_inner();
    let Some(worker) = inner.worker.take() else {
      return;
    };

    // Drain the capture path before touching the collector.
    worker.stop_and_join();
    if let Err(err) = self.collector.flush() {
      error!("failed to flush profile: {err}");
    }

    match Worker::spawn(
      Arc::clone(&self.collector),
      inner.filter.clone(),
      inner.period,
    ) {
      Ok(worker) => inner.worker = Some(worker),
      Err(err) => {
        error!("failed to restart sampling thread: {err}");
        let _ = self.collector.stop();
      }
    }
  }

  #[must_use]
  pub fn new(collector: Arc<dyn Collector>) -> Self {
    Self {
      collector,
      inner: Mutex::new(SamplerInner {
        filter: None,
        period: Duration::from_secs(1),
        worker: None,
      }),
    }
  }

  /// Start sampling to `path`.
  ///
  /// # Errors
  ///
  /// Fails with [`SamplerError::AlreadyEnabled`], without side effects, if
  /// sampling is already running; propagates collector start failures.
  pub fn start(
    &self,
    path: &Path,
    options: SamplerOptions,
  ) -> Result<(), SamplerError> {
    let mut inner = self.lock_inner();
    if inner.worker.is_some() || self.collector.enabled() {
      return Err(SamplerError::AlreadyEnabled);
    }

    self.collector.start(path, options.frequency_hz)?;

    inner.filter = options.filter;
    inner.period =
      Duration::from_micros(1_000_000 / u64::from(options.frequency_hz.max(1)));

    match Worker::spawn(
      Arc::clone(&self.collector),
      inner.filter.clone(),
      inner.period,
    ) {
      Ok(worker) => {
        inner.worker = Some(worker);
        Ok(())
      }
      Err(err) => {
        let _ = self.collector.stop();
        Err(SamplerError::Io(err))
      }
    }
  }

  /// Stop sampling; the collector flushes its data to disk.
  ///
  /// A silent no-op when sampling is disabled.
  pub fn stop(&self) {
    let mut inner = self.lock_inner();
    let Some(worker) = inner.worker.take() else {
      return;
    };

    // Drained worker first: no capture can race the collector shutdown.
    worker.stop_and_join();
    if let Err(err) = self.collector.stop() {
      error!("failed to write profile on stop: {err}");
    }
  }

  fn lock_inner(&self) -> MutexGuard<'_, SamplerInner> {
    lock_recover(&self.inner)
  }
}

impl Drop for Sampler {
  fn drop(&mut self) {
    self.stop();
  }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

/// Pending toggle deliveries, bumped from the signal handler. The handler
/// must stay async-signal-safe, so it only touches this atomic.
static TOGGLE_PENDING: AtomicUsize = AtomicUsize::new(0);

extern "C" fn toggle_handler(_signum: libc::c_int) {
  TOGGLE_PENDING.fetch_add(1, Ordering::SeqCst);
}

struct ToggleWatcher {
  handle: JoinHandle<()>,
  shared: Arc<WorkerShared>,
  signum: libc::c_int,
}

impl ToggleWatcher {
  /// Register the toggle handler for `signum` and start the watcher
  /// thread that alternately starts and stops sampling to sequentially
  /// numbered outputs.
  fn install(
    sampler: Arc<Sampler>,
    base: PathBuf,
    signum: i32,
  ) -> Result<Self, SamplerError> {
    // SAFETY: the installed handler only increments an atomic counter.
    let previous =
      unsafe { libc::signal(signum, toggle_handler as libc::sighandler_t) };
    if previous == libc::SIG_ERR {
      return Err(SamplerError::Io(io::Error::last_os_error()));
    }
    if previous != libc::SIG_DFL {
      // SAFETY: restores the handler we just displaced.
      unsafe { libc::signal(signum, previous) };
      return Err(SamplerError::SignalInUse(signum));
    }
    info!("using signal {signum} as sampling switch");

    let shared = Arc::new(WorkerShared::default());
    let thread_shared = Arc::clone(&shared);

    let handle = thread::Builder::new()
      .name("stacktally-toggle".into())
      .spawn(move || {
        run_toggle_loop(&thread_shared, &sampler, &base);
      })
      .map_err(SamplerError::Io)?;

    Ok(Self {
      handle,
      shared,
      signum,
    })
  }

  fn shutdown(self) {
    *lock_recover(&self.shared.stop) = true;
    self.shared.cond.notify_all();
    let _ = self.handle.join();
    // SAFETY: gives the signal back its default disposition.
    unsafe { libc::signal(self.signum, libc::SIG_DFL) };
  }
}

fn run_toggle_loop(shared: &WorkerShared, sampler: &Sampler, base: &Path) {
  let mut sequence = 0u32;
  let mut stop = lock_recover(&shared.stop);

  loop {
    let (guard, _) = match shared.cond.wait_timeout(stop, TOGGLE_POLL) {
      Ok(pair) => pair,
      Err(err) => err.into_inner(),
    };
    stop = guard;
    if *stop {
      break;
    }

    let pending = TOGGLE_PENDING.swap(0, Ordering::SeqCst);
    for _ in 0..pending {
      if sampler.enabled() {
        sampler.stop();
      } else {
        let path = PathBuf::from(format!("{}.{sequence}", base.display()));
        sequence += 1;
        if let Err(err) = sampler.start(&path, SamplerOptions::default()) {
          error!("cannot turn on sampling to {}: {err}", path.display());
        }
      }
    }
  }
}

/// Explicitly owned profiling handle, created at a defined startup point.
///
/// Construction applies the environment policy: auto-start when the
/// output-path variable is set, or toggle-signal control when the signal
/// variable is set as well. Dropping the handle tears the watcher down
/// and stops sampling.
pub struct Profiler {
  sampler: Arc<Sampler>,
  toggle: Option<ToggleWatcher>,
}

impl Profiler {
  /// Apply an already-parsed environment policy.
  ///
  /// # Errors
  ///
  /// Fails if the toggle signal cannot be claimed or auto-start fails;
  /// both indicate misconfiguration the caller should treat as fatal.
  pub fn init(
    collector: Arc<dyn Collector>,
    env: &ProfileEnv,
  ) -> Result<Self, SamplerError> {
    let sampler = Arc::new(Sampler::new(collector));
    let mut profiler = Self {
      sampler,
      toggle: None,
    };

    let Some(path) = &env.path else {
      return Ok(profiler);
    };

    match env.toggle_signal {
      Some(signum) => {
        profiler.toggle = Some(ToggleWatcher::install(
          Arc::clone(&profiler.sampler),
          path.clone(),
          signum,
        )?);
      }
      None => {
        profiler.sampler.start(path, SamplerOptions::default())?;
      }
    }

    Ok(profiler)
  }

  /// Read the environment and apply its policy.
  ///
  /// # Errors
  ///
  /// Propagates environment parse failures and [`Profiler::init`] errors.
  pub fn init_from_env(
    collector: Arc<dyn Collector>,
  ) -> Result<Self, SamplerError> {
    let env = ProfileEnv::from_env()?;
    Self::init(collector, &env)
  }

  #[must_use]
  pub fn sampler(&self) -> &Sampler {
    &self.sampler
  }
}

impl Drop for Profiler {
  fn drop(&mut self) {
    if let Some(watcher) = self.toggle.take() {
      watcher.shutdown();
    }
    self.sampler.stop();
  }
}
