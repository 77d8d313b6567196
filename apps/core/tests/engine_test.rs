use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use roster_core::engine::{EngineError, EngineSettings, SyncEngine};
use roster_core::event_source::{ChannelEventSource, EventSource, PackageEvent};
use roster_core::model::PackageInfo;
use roster_core::package_source::{FixedPackageSource, PackageSource, SourceError};
use roster_core::pin_store::{MemoryPinStore, PinStore, PinnedSet};
use roster_core::uninstall::{UninstallError, UninstallRequester, UninstallResolution};

const WAIT: Duration = Duration::from_secs(3);

/// Fixture source that counts calls and can fail or stall on demand.
#[derive(Default)]
struct CountingSource {
    inner: FixedPackageSource,
    list_calls: AtomicUsize,
    query_calls: AtomicUsize,
    fail_next_lists: AtomicUsize,
    list_delay: Mutex<Option<Duration>>,
}

impl CountingSource {
    fn fixture() -> Self {
        Self {
            inner: FixedPackageSource::deterministic_fixture(),
            ..Default::default()
        }
    }

    fn lists(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn queries(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }
}

impl PackageSource for CountingSource {
    fn source_name(&self) -> &'static str {
        "counting"
    }

    fn list_all(&self) -> Result<Vec<PackageInfo>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let failing = self
            .fail_next_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::unavailable("package manager busy"));
        }
        self.inner.list_all()
    }

    fn query(&self, identifier: &str) -> Result<PackageInfo, SourceError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.query(identifier)
    }
}

#[derive(Default)]
struct RecordingUninstaller {
    requested: Mutex<Vec<String>>,
    fail: bool,
}

impl UninstallRequester for RecordingUninstaller {
    fn request_uninstall(&self, identifier: &str) -> Result<(), UninstallError> {
        if self.fail {
            return Err(UninstallError::Launch {
                identifier: identifier.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no uninstaller"),
            });
        }
        self.requested.lock().push(identifier.to_string());
        Ok(())
    }
}

fn fast_settings() -> EngineSettings {
    EngineSettings {
        self_identifier: None,
        coalesce_window: Duration::from_millis(40),
        settle_window: Duration::from_millis(120),
        uninstall_grace: Duration::from_millis(50),
        resume_refresh_delay: Duration::from_millis(10),
        source_timeout: Duration::from_secs(1),
        reload_retry_limit: 2,
        reload_retry_backoff: Duration::from_millis(20),
    }
}

fn started(
    source: Arc<CountingSource>,
    pins: Arc<MemoryPinStore>,
    settings: EngineSettings,
) -> SyncEngine {
    let pins: Arc<dyn PinStore> = pins;
    let engine = SyncEngine::new(source, pins, settings).unwrap();
    let subscription = engine.observe();
    engine.start().unwrap();
    subscription
        .wait_for(WAIT, |snapshot| snapshot.is_initialized())
        .expect("initial load should complete");
    engine
}

fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn start_loads_source_and_seeds_pins() {
    let source = Arc::new(CountingSource::fixture());
    let pins = Arc::new(MemoryPinStore::with_pins(["org.gnome.Maps"]));
    let engine = started(Arc::clone(&source), pins, fast_settings());

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.get("org.gnome.Maps").unwrap().pinned);
    assert!(!snapshot.get("org.mozilla.firefox").unwrap().pinned);
    assert_eq!(source.lists(), 1);
}

#[test]
fn burst_for_one_identifier_queries_once_then_reloads_once() {
    let source = Arc::new(CountingSource::fixture());
    let engine = started(
        Arc::clone(&source),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    );
    assert_eq!(source.lists(), 1);

    for _ in 0..5 {
        assert!(engine.submit_event(PackageEvent::changed("org.gnome.Maps")));
    }

    assert!(wait_until(|| source.lists() >= 2));
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(source.queries(), 1);
    assert_eq!(source.lists(), 2);
}

#[test]
fn removal_event_drops_record_and_persists_pins() {
    let source = Arc::new(CountingSource::fixture());
    let pins = Arc::new(MemoryPinStore::with_pins(["org.gnome.Maps", "org.mozilla.firefox"]));
    let engine = started(Arc::clone(&source), Arc::clone(&pins), fast_settings());

    let subscription = engine.observe();
    source.inner.remove("org.gnome.Maps");
    engine.submit_event(PackageEvent::removed("org.gnome.Maps"));

    subscription
        .wait_for(WAIT, |snapshot| snapshot.get("org.gnome.Maps").is_none())
        .expect("removal should publish a snapshot");
    assert!(wait_until(|| !pins.current().contains("org.gnome.Maps")));
    assert!(pins.current().contains("org.mozilla.firefox"));
}

#[test]
fn added_event_is_picked_up_through_event_sink() {
    let source = Arc::new(CountingSource::fixture());
    let engine = started(
        Arc::clone(&source),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    );

    let mut events = ChannelEventSource::default();
    let injector = events.injector();
    events.register(engine.event_sink()).unwrap();

    let subscription = engine.observe();
    source
        .inner
        .upsert(PackageInfo::new("org.gnome.Weather", "Weather", "weather"));
    assert!(injector.inject(PackageEvent::added("org.gnome.Weather")));

    let snapshot = subscription
        .wait_for(WAIT, |snapshot| snapshot.get("org.gnome.Weather").is_some())
        .expect("added app should appear");
    assert_eq!(snapshot.get("org.gnome.Weather").unwrap().display_name(), "Weather");

    events.deregister();
    assert!(!injector.inject(PackageEvent::added("late")));
}

#[test]
fn toggle_reports_persistence_outcome() {
    let source = Arc::new(CountingSource::fixture());
    let pins = Arc::new(MemoryPinStore::default());
    let engine = started(source, Arc::clone(&pins), fast_settings());

    let toggle = engine.toggle_pin("org.mozilla.firefox").unwrap();
    assert!(toggle.pinned);
    assert!(toggle.snapshot.get("org.mozilla.firefox").unwrap().pinned);
    assert!(matches!(toggle.wait_persisted(WAIT), Some(Ok(()))));
    assert_eq!(
        pins.current(),
        PinnedSet::from(["org.mozilla.firefox".to_string()])
    );
}

#[test]
fn failed_pin_write_keeps_memory_state_and_surfaces_error() {
    let source = Arc::new(CountingSource::fixture());
    let pins = Arc::new(MemoryPinStore::default());
    let engine = started(source, Arc::clone(&pins), fast_settings());
    pins.set_fail_saves(true);

    let toggle = engine.toggle_pin("org.gnome.Maps").unwrap();
    assert!(matches!(toggle.wait_persisted(WAIT), Some(Err(_))));
    assert!(engine.snapshot().get("org.gnome.Maps").unwrap().pinned);
    assert!(pins.current().is_empty());
}

#[test]
fn toggle_unknown_identifier_is_an_error() {
    let engine = started(
        Arc::new(CountingSource::fixture()),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    );
    assert!(matches!(
        engine.toggle_pin("nope"),
        Err(EngineError::Registry(_))
    ));
}

#[test]
fn resume_after_grace_forces_full_load_then_resets() {
    let source = Arc::new(CountingSource::fixture());
    let engine = started(
        Arc::clone(&source),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    );
    engine.registry().begin_uninstall_tracking("org.mozilla.firefox");

    engine.pause();
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(engine.resume().unwrap(), UninstallResolution::ForceReload);
    assert!(wait_until(|| source.lists() >= 2));

    // Still installed, so the forced load could not settle it.
    engine.pause();
    std::thread::sleep(Duration::from_millis(80));
    let subscription = engine.observe();
    assert_eq!(engine.resume().unwrap(), UninstallResolution::Reset);
    assert!(engine.registry().pending_uninstalls().is_empty());

    subscription
        .wait_for(WAIT, |snapshot| !snapshot.is_initialized())
        .expect("reset should publish an empty snapshot");
    subscription
        .wait_for(WAIT, |snapshot| snapshot.is_initialized() && snapshot.len() == 3)
        .expect("reset should be followed by a fresh load");
}

#[test]
fn resume_without_pending_uninstalls_refreshes() {
    let source = Arc::new(CountingSource::fixture());
    let engine = started(
        Arc::clone(&source),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    );

    assert_eq!(engine.resume().unwrap(), UninstallResolution::Settled);
    engine.pause();
    assert!(engine.is_paused());
    assert_eq!(engine.resume().unwrap(), UninstallResolution::Settled);
    assert!(wait_until(|| source.lists() >= 2));
}

#[test]
fn failed_load_is_retried() {
    let source = Arc::new(CountingSource::fixture());
    source.fail_next_lists.store(1, Ordering::SeqCst);
    let engine = started(
        Arc::clone(&source),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    );

    assert_eq!(engine.snapshot().len(), 3);
    assert_eq!(engine.counters().failed_loads, 1);
    assert_eq!(source.lists(), 2);
}

#[test]
fn hung_source_times_out() {
    let source = Arc::new(CountingSource::fixture());
    *source.list_delay.lock() = Some(Duration::from_millis(400));
    let settings = EngineSettings {
        source_timeout: Duration::from_millis(50),
        reload_retry_limit: 0,
        ..fast_settings()
    };
    let engine = SyncEngine::new(source, Arc::new(MemoryPinStore::default()), settings).unwrap();
    engine.start().unwrap();

    assert!(wait_until(|| engine.counters().failed_loads == 1));
    assert!(!engine.snapshot().is_initialized());
}

#[test]
fn results_after_shutdown_are_discarded() {
    let source = Arc::new(CountingSource::fixture());
    *source.list_delay.lock() = Some(Duration::from_millis(150));
    let engine = SyncEngine::new(
        source,
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    )
    .unwrap();
    engine.start().unwrap();
    engine.shutdown();

    assert!(!engine.is_running());
    assert!(!engine.snapshot().is_initialized());
    assert!(!engine.submit_event(PackageEvent::added("x")));
    assert!(matches!(engine.reload(), Err(EngineError::Stopped)));
    engine.shutdown();
}

#[test]
fn own_identifier_is_never_listed() {
    let settings = EngineSettings {
        self_identifier: Some("org.gnome.Calculator".to_string()),
        ..fast_settings()
    };
    let engine = started(
        Arc::new(CountingSource::fixture()),
        Arc::new(MemoryPinStore::default()),
        settings,
    );
    assert!(engine.snapshot().get("org.gnome.Calculator").is_none());
    assert_eq!(engine.snapshot().len(), 2);
}

#[test]
fn uninstall_records_intent_and_clears_it_on_failure() {
    let source = Arc::new(CountingSource::fixture());
    let uninstaller = Arc::new(RecordingUninstaller::default());
    let engine = started(
        Arc::clone(&source),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    )
    .with_uninstaller(uninstaller.clone());

    engine.uninstall("org.gnome.Maps").unwrap();
    assert_eq!(engine.registry().pending_uninstalls(), vec!["org.gnome.Maps"]);
    assert_eq!(*uninstaller.requested.lock(), vec!["org.gnome.Maps"]);
    assert!(matches!(
        engine.uninstall("missing"),
        Err(EngineError::Registry(_))
    ));

    let failing = started(
        Arc::new(CountingSource::fixture()),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    )
    .with_uninstaller(Arc::new(RecordingUninstaller {
        fail: true,
        ..Default::default()
    }));
    assert!(matches!(
        failing.uninstall("org.gnome.Maps"),
        Err(EngineError::Uninstall(_))
    ));
    assert!(failing.registry().pending_uninstalls().is_empty());
}

#[test]
fn uninstall_without_requester_is_rejected() {
    let engine = started(
        Arc::new(CountingSource::fixture()),
        Arc::new(MemoryPinStore::default()),
        fast_settings(),
    );
    assert!(matches!(
        engine.uninstall("org.gnome.Maps"),
        Err(EngineError::Uninstall(UninstallError::NotConfigured))
    ));
}

#[test]
fn unreadable_store_at_startup_does_not_lose_stored_pins() {
    let source = Arc::new(CountingSource::fixture());
    let pins = Arc::new(MemoryPinStore::with_pins(["org.gnome.Maps"]));
    pins.set_fail_loads(true);
    let engine = started(source, Arc::clone(&pins), fast_settings());
    assert!(!engine.snapshot().get("org.gnome.Maps").unwrap().pinned);

    pins.set_fail_loads(false);
    let toggle = engine.toggle_pin("org.mozilla.firefox").unwrap();
    assert!(matches!(toggle.wait_persisted(WAIT), Some(Ok(()))));

    assert_eq!(
        pins.current(),
        PinnedSet::from(["org.gnome.Maps".to_string(), "org.mozilla.firefox".to_string()])
    );
    assert!(engine.snapshot().get("org.gnome.Maps").unwrap().pinned);
}

#[test]
fn pin_write_is_refused_while_store_stays_unreadable() {
    let source = Arc::new(CountingSource::fixture());
    let pins = Arc::new(MemoryPinStore::with_pins(["org.gnome.Maps"]));
    pins.set_fail_loads(true);
    let engine = started(source, Arc::clone(&pins), fast_settings());

    let toggle = engine.toggle_pin("org.mozilla.firefox").unwrap();
    assert!(matches!(toggle.wait_persisted(WAIT), Some(Err(_))));
    assert!(engine.snapshot().get("org.mozilla.firefox").unwrap().pinned);
    assert_eq!(pins.current(), PinnedSet::from(["org.gnome.Maps".to_string()]));
    assert!(pins.save_history().is_empty());
}

#[test]
fn queued_pin_writes_store_the_latest_pinned_set() {
    let source = Arc::new(CountingSource::fixture());
    let pins = Arc::new(MemoryPinStore::default());
    let engine = started(Arc::clone(&source), Arc::clone(&pins), fast_settings());

    let first = engine.toggle_pin("org.gnome.Maps").unwrap();
    let second = engine.toggle_pin("org.mozilla.firefox").unwrap();
    source.inner.remove("org.gnome.Maps");
    engine.submit_event(PackageEvent::removed("org.gnome.Maps"));
    let third = engine.toggle_pin("org.gnome.Calculator").unwrap();

    for toggle in [&first, &second, &third] {
        assert!(matches!(toggle.wait_persisted(WAIT), Some(Ok(()))));
    }
    let expected = PinnedSet::from([
        "org.mozilla.firefox".to_string(),
        "org.gnome.Calculator".to_string(),
    ]);
    assert!(wait_until(|| pins.current() == expected));
    assert_eq!(engine.snapshot().pinned_identifiers(), expected);
}
