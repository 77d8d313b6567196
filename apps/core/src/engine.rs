use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::debounce::{Debouncer, Fired};
use crate::event_source::{EventSink, PackageEvent};
use crate::package_source::{PackageSource, SourceError};
use crate::pin_store::{PinStore, PinStoreError, PinnedSet};
use crate::registry::{EventEffect, Registry, RegistryError, Snapshot, Subscription};
use crate::uninstall::{UninstallError, UninstallRequester, UninstallResolution};

const IDLE_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Uninstall(#[from] UninstallError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("engine is shut down")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub self_identifier: Option<String>,
    pub coalesce_window: Duration,
    pub settle_window: Duration,
    pub uninstall_grace: Duration,
    pub resume_refresh_delay: Duration,
    pub source_timeout: Duration,
    pub reload_retry_limit: u32,
    pub reload_retry_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let self_identifier = Some(cfg.self_identifier.trim().to_string()).filter(|id| !id.is_empty());
        Self {
            self_identifier,
            coalesce_window: cfg.coalesce_window(),
            settle_window: cfg.settle_window(),
            uninstall_grace: cfg.uninstall_grace(),
            resume_refresh_delay: cfg.resume_refresh_delay(),
            source_timeout: cfg.source_timeout(),
            reload_retry_limit: cfg.reload_retry_limit,
            reload_retry_backoff: cfg.reload_retry_backoff(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineCounters {
    pub full_loads: u64,
    pub failed_loads: u64,
    pub queries: u64,
    pub pin_writes: u64,
}

#[derive(Default)]
struct Counters {
    full_loads: AtomicU64,
    failed_loads: AtomicU64,
    queries: AtomicU64,
    pin_writes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn read(&self) -> EngineCounters {
        EngineCounters {
            full_loads: self.full_loads.load(Ordering::Relaxed),
            failed_loads: self.failed_loads.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            pin_writes: self.pin_writes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub version: u64,
    pub initialized: bool,
    pub records: usize,
    pub pinned: usize,
    pub paused: bool,
    pub query: String,
    pub pending_uninstalls: Vec<String>,
    pub counters: EngineCounters,
}

/// Result of a pin toggle. The in-memory state is already committed; the
/// persistence outcome arrives later on `outcome`.
pub struct PinToggle {
    pub identifier: String,
    pub pinned: bool,
    pub snapshot: Arc<Snapshot>,
    outcome: Receiver<Result<(), PinStoreError>>,
}

impl PinToggle {
    /// `None` when the write did not complete within `timeout` or the engine
    /// went away before running it.
    pub fn wait_persisted(&self, timeout: Duration) -> Option<Result<(), PinStoreError>> {
        self.outcome.recv_timeout(timeout).ok()
    }
}

enum Control {
    Reload(Instant),
    Retry { at: Instant, attempt: u32 },
    Stop,
}

enum Job {
    SeedPins,
    FullLoad { attempt: u32 },
    Query(String),
    /// Writes whatever is pinned when the job runs, so writes queued from
    /// different threads cannot land out of order.
    Persist {
        reply: Option<Sender<Result<(), PinStoreError>>>,
    },
    Stop,
}

struct Shared {
    registry: Arc<Registry>,
    source: Arc<dyn PackageSource>,
    pins: Arc<dyn PinStore>,
    settings: EngineSettings,
    alive: AtomicBool,
    paused: AtomicBool,
    /// False until the store has been read once. Writes are refused before
    /// that so an unreadable store is never overwritten with a partial set.
    pins_seeded: AtomicBool,
    list_call: Arc<AtomicBool>,
    query_call: Arc<AtomicBool>,
    counters: Counters,
}

impl Shared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Keeps a [`Registry`] in step with a package source, an event stream and a
/// pin store. Debounce timers run on a scheduler thread; every source call and
/// pin write runs on a worker thread, never under the registry lock.
pub struct SyncEngine {
    shared: Arc<Shared>,
    event_tx: Sender<PackageEvent>,
    control_tx: Sender<Control>,
    job_tx: Sender<Job>,
    uninstaller: Option<Arc<dyn UninstallRequester>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn PackageSource>,
        pins: Arc<dyn PinStore>,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(Registry::new(
            settings.self_identifier.clone(),
            PinnedSet::new(),
            settings.uninstall_grace,
        ));
        let shared = Arc::new(Shared {
            registry,
            source,
            pins,
            settings,
            alive: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            pins_seeded: AtomicBool::new(false),
            list_call: Arc::new(AtomicBool::new(false)),
            query_call: Arc::new(AtomicBool::new(false)),
            counters: Counters::default(),
        });

        let (event_tx, event_rx) = crossbeam_channel::unbounded::<PackageEvent>();
        let (control_tx, control_rx) = crossbeam_channel::unbounded::<Control>();
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<Job>();

        let worker = {
            let shared = Arc::clone(&shared);
            let control_tx = control_tx.clone();
            std::thread::Builder::new()
                .name("roster-worker".to_string())
                .spawn(move || worker_loop(shared, job_rx, control_tx))
                .map_err(|source| EngineError::Spawn {
                    name: "worker",
                    source,
                })?
        };

        let scheduler = {
            let scheduler_shared = Arc::clone(&shared);
            let scheduler_jobs = job_tx.clone();
            let spawned = std::thread::Builder::new()
                .name("roster-scheduler".to_string())
                .spawn(move || scheduler_loop(scheduler_shared, event_rx, control_rx, scheduler_jobs));
            match spawned {
                Ok(handle) => handle,
                Err(source) => {
                    shared.alive.store(false, Ordering::SeqCst);
                    let _ = job_tx.send(Job::Stop);
                    let _ = worker.join();
                    return Err(EngineError::Spawn {
                        name: "scheduler",
                        source,
                    });
                }
            }
        };

        Ok(Self {
            shared,
            event_tx,
            control_tx,
            job_tx,
            uninstaller: None,
            scheduler: Mutex::new(Some(scheduler)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn with_uninstaller(mut self, uninstaller: Arc<dyn UninstallRequester>) -> Self {
        self.uninstaller = Some(uninstaller);
        self
    }

    /// Seeds the persisted pins, then runs the first full load.
    pub fn start(&self) -> Result<(), EngineError> {
        self.dispatch(Job::SeedPins)?;
        self.dispatch(Job::FullLoad { attempt: 0 })
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.shared.registry)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.shared.registry.snapshot()
    }

    pub fn observe(&self) -> Subscription {
        self.shared.registry.observe()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    pub fn counters(&self) -> EngineCounters {
        self.shared.counters.read()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Sink for event sources; events pushed after shutdown are dropped.
    pub fn event_sink(&self) -> EventSink {
        EventSink::new(self.event_tx.clone())
    }

    pub fn submit_event(&self, event: PackageEvent) -> bool {
        if !self.shared.is_alive() || event.identifier.trim().is_empty() {
            return false;
        }
        self.event_tx.send(event).is_ok()
    }

    pub fn toggle_pin(&self, identifier: &str) -> Result<PinToggle, EngineError> {
        if !self.shared.is_alive() {
            return Err(EngineError::Stopped);
        }
        let toggled = self.shared.registry.toggle_pin(identifier)?;
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self
            .job_tx
            .send(Job::Persist {
                reply: Some(reply_tx),
            })
            .is_err()
        {
            log::warn!("pin write for {identifier} not scheduled: worker is gone");
        }
        Ok(PinToggle {
            identifier: toggled.identifier,
            pinned: toggled.pinned,
            snapshot: toggled.snapshot,
            outcome: reply_rx,
        })
    }

    pub fn reload(&self) -> Result<(), EngineError> {
        self.control(Control::Reload(Instant::now()))
    }

    pub fn set_query(&self, query: &str) {
        self.shared.registry.set_query(query);
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Coming back from the background. Overdue uninstalls force a reload (or
    /// a reset once a forced reload did not settle them); otherwise a normal
    /// refresh is scheduled shortly after.
    pub fn resume(&self) -> Result<UninstallResolution, EngineError> {
        if !self.shared.is_alive() {
            return Err(EngineError::Stopped);
        }
        if !self.shared.paused.swap(false, Ordering::SeqCst) {
            return Ok(UninstallResolution::Settled);
        }

        let resolution = self.shared.registry.resolve_uninstall_tracking();
        match resolution {
            UninstallResolution::Settled => {
                let at = Instant::now() + self.shared.settings.resume_refresh_delay;
                self.control(Control::Reload(at))?;
            }
            UninstallResolution::ForceReload => {
                log::info!("uninstall outlived grace period; forcing full load");
                self.control(Control::Reload(Instant::now()))?;
            }
            UninstallResolution::Reset => {
                log::info!("uninstall still unresolved after forced load; resetting registry");
                self.shared.registry.reset();
                self.control(Control::Reload(Instant::now()))?;
            }
        }
        Ok(resolution)
    }

    /// Records intent and hands the identifier to the OS uninstall flow.
    pub fn uninstall(&self, identifier: &str) -> Result<(), EngineError> {
        let requester = self
            .uninstaller
            .as_ref()
            .ok_or(EngineError::Uninstall(UninstallError::NotConfigured))?;
        let registry = &self.shared.registry;
        if registry.snapshot().get(identifier).is_none() {
            return Err(RegistryError::UnknownIdentifier(identifier.to_string()).into());
        }

        registry.begin_uninstall_tracking(identifier);
        if let Err(error) = requester.request_uninstall(identifier) {
            registry.cancel_uninstall_tracking(identifier);
            log::warn!("uninstall request for {identifier} failed: {error}");
            return Err(error.into());
        }
        log::info!("uninstall requested for {identifier}");
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        let registry = &self.shared.registry;
        let snapshot = registry.snapshot();
        EngineStatus {
            version: snapshot.version(),
            initialized: snapshot.is_initialized(),
            records: snapshot.len(),
            pinned: snapshot.pinned_identifiers().len(),
            paused: self.is_paused(),
            query: registry.current_query(),
            pending_uninstalls: registry.pending_uninstalls(),
            counters: self.counters(),
        }
    }

    /// Stops both threads. Source results that arrive afterwards are
    /// discarded; queued pin writes are still flushed.
    pub fn shutdown(&self) {
        if !self.shared.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.control_tx.send(Control::Stop);
        let _ = self.job_tx.send(Job::Stop);
        if let Some(handle) = self.scheduler.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        log::info!("sync engine stopped");
    }

    fn dispatch(&self, job: Job) -> Result<(), EngineError> {
        if !self.shared.is_alive() {
            return Err(EngineError::Stopped);
        }
        self.job_tx.send(job).map_err(|_| EngineError::Stopped)
    }

    fn control(&self, message: Control) -> Result<(), EngineError> {
        if !self.shared.is_alive() {
            return Err(EngineError::Stopped);
        }
        self.control_tx.send(message).map_err(|_| EngineError::Stopped)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_loop(
    shared: Arc<Shared>,
    events: Receiver<PackageEvent>,
    control: Receiver<Control>,
    jobs: Sender<Job>,
) {
    let settings = &shared.settings;
    let mut debouncer: Debouncer<String, PackageEvent> =
        Debouncer::new(settings.coalesce_window, settings.settle_window);
    let mut retry: Option<(Instant, u32)> = None;

    loop {
        let deadline = match (debouncer.next_deadline(), retry.map(|(at, _)| at)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let wait = deadline
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => {
                    let merged = debouncer.push(event.identifier.clone(), event, Instant::now());
                    if merged > 0 {
                        log::debug!("coalesced {merged} duplicate event(s)");
                    }
                }
                Err(_) => return,
            },
            recv(control) -> message => match message {
                Ok(Control::Reload(at)) => debouncer.schedule_reload(at),
                Ok(Control::Retry { at, attempt }) => retry = Some((at, attempt)),
                Ok(Control::Stop) | Err(_) => return,
            },
            default(wait) => {}
        }

        if !shared.is_alive() {
            return;
        }

        let now = Instant::now();
        for fired in debouncer.poll(now) {
            let job = match fired {
                Fired::Key(_, event) => match apply_event(&shared, &event) {
                    Some(job) => job,
                    None => continue,
                },
                Fired::Reload => {
                    retry = None;
                    Job::FullLoad { attempt: 0 }
                }
            };
            if jobs.send(job).is_err() {
                return;
            }
        }

        if let Some((at, attempt)) = retry {
            if at <= now {
                retry = None;
                if jobs.send(Job::FullLoad { attempt }).is_err() {
                    return;
                }
            }
        }
    }
}

fn apply_event(shared: &Shared, event: &PackageEvent) -> Option<Job> {
    match shared.registry.apply_event(event) {
        EventEffect::Ignored => {
            log::debug!("event {:?} for {} ignored", event.kind, event.identifier);
            None
        }
        EventEffect::Inconsistent => None,
        EventEffect::Removed { pins } => pins.map(|_| Job::Persist { reply: None }),
        EventEffect::Refresh(identifier) => Some(Job::Query(identifier)),
    }
}

fn worker_loop(shared: Arc<Shared>, jobs: Receiver<Job>, control: Sender<Control>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::SeedPins => seed_pins(&shared),
            Job::FullLoad { attempt } => full_load(&shared, &control, attempt),
            Job::Query(identifier) => query_one(&shared, &control, &identifier),
            Job::Persist { reply } => persist(&shared, reply),
            Job::Stop => break,
        }
    }

    // Pin writes queued before shutdown still reach the store.
    for job in jobs.try_iter() {
        if let Job::Persist { reply } = job {
            persist(&shared, reply);
        }
    }
}

fn seed_pins(shared: &Shared) {
    if let Err(error) = ensure_pins_seeded(shared) {
        log::warn!("pin store unreadable, pins stay unsaved until it recovers: {error}");
    }
}

/// Reads the durable pins if that has not succeeded yet. Stored pins are
/// merged into whatever was pinned in memory meanwhile.
fn ensure_pins_seeded(shared: &Shared) -> Result<(), PinStoreError> {
    if shared.pins_seeded.load(Ordering::SeqCst) {
        return Ok(());
    }
    let stored = shared.pins.load()?;
    log::debug!("seeded {} pinned identifier(s)", stored.len());
    shared.registry.adopt_persisted(stored);
    shared.pins_seeded.store(true, Ordering::SeqCst);
    Ok(())
}

fn full_load(shared: &Shared, control: &Sender<Control>, attempt: u32) {
    if !shared.is_alive() {
        return;
    }
    Counters::bump(&shared.counters.full_loads);
    if let Err(error) = ensure_pins_seeded(shared) {
        log::debug!("loading without stored pins: {error}");
    }

    let source = Arc::clone(&shared.source);
    let result = call_with_timeout(shared.settings.source_timeout, &shared.list_call, move || {
        source.list_all()
    });
    match result {
        Ok(apps) => {
            if !shared.is_alive() {
                log::debug!("discarding full load that finished after shutdown");
                return;
            }
            let outcome = shared.registry.load(apps);
            if outcome.pins_to_persist.is_some() {
                persist(shared, None);
            }
        }
        Err(error) => {
            Counters::bump(&shared.counters.failed_loads);
            let settings = &shared.settings;
            if attempt >= settings.reload_retry_limit {
                log::warn!("full load failed after {attempt} retries: {error}");
                return;
            }
            let backoff = settings
                .reload_retry_backoff
                .saturating_mul(1u32 << attempt.min(16));
            log::warn!("full load failed, retrying in {backoff:?}: {error}");
            let _ = control.send(Control::Retry {
                at: Instant::now() + backoff,
                attempt: attempt + 1,
            });
        }
    }
}

fn query_one(shared: &Shared, control: &Sender<Control>, identifier: &str) {
    if !shared.is_alive() {
        return;
    }
    Counters::bump(&shared.counters.queries);

    let source = Arc::clone(&shared.source);
    let owned = identifier.to_string();
    let result = call_with_timeout(shared.settings.source_timeout, &shared.query_call, move || {
        source.query(&owned)
    });
    match result {
        Ok(info) => {
            if shared.is_alive() {
                shared.registry.upsert(info);
            }
        }
        Err(error) => {
            match error {
                SourceError::NotFound(_) => {
                    log::debug!("{identifier} vanished before re-query; falling back to full load")
                }
                other => log::warn!("re-query of {identifier} failed: {other}"),
            }
            let _ = control.send(Control::Reload(Instant::now()));
        }
    }
}

fn persist(shared: &Shared, reply: Option<Sender<Result<(), PinStoreError>>>) {
    let result = write_pins(shared);
    if let Err(error) = &result {
        log::warn!("pinned apps not persisted: {error}");
    }
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

fn write_pins(shared: &Shared) -> Result<(), PinStoreError> {
    ensure_pins_seeded(shared).map_err(|error| {
        PinStoreError::Unavailable(format!("stored pins unreadable, write refused: {error}"))
    })?;
    let Some(pins) = shared.registry.pins_to_write() else {
        log::debug!("pin write skipped: registry not loaded");
        return Ok(());
    };
    shared.pins.save(&pins)?;
    Counters::bump(&shared.counters.pin_writes);
    shared.registry.record_persisted(pins);
    Ok(())
}

/// Clears the in-flight flag when the helper thread finishes, panics included.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs a source call on a helper thread so a hung call completes as
/// `Timeout`. A late result goes nowhere. While an earlier call guarded by
/// `busy` is still running no new thread is started.
fn call_with_timeout<T, F>(timeout: Duration, busy: &Arc<AtomicBool>, call: F) -> Result<T, SourceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SourceError> + Send + 'static,
{
    if busy.swap(true, Ordering::SeqCst) {
        return Err(SourceError::Busy);
    }
    let guard = InFlight(Arc::clone(busy));
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("roster-source-call".to_string())
        .spawn(move || {
            let _guard = guard;
            let _ = tx.send(call());
        })
        .map_err(|error| SourceError::unavailable(format!("failed to spawn source call: {error}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(SourceError::Timeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(SourceError::unavailable("source call ended without a result"))
        }
    }
}
