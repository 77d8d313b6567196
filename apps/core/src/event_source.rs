use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::model::PackageInfo;
use crate::package_source::{PackageSource, SourceError};

pub const PACKAGE_SCHEME: &str = "package";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Removed,
    FullyRemoved,
    Replaced,
    Changed,
}

impl EventKind {
    pub fn is_removal(self) -> bool {
        matches!(self, Self::Removed | Self::FullyRemoved)
    }

    fn from_action(action: &str) -> Option<Self> {
        let short = action.rsplit('.').next().unwrap_or(action);
        match short {
            "PACKAGE_ADDED" => Some(Self::Added),
            "PACKAGE_REMOVED" => Some(Self::Removed),
            "PACKAGE_FULLY_REMOVED" => Some(Self::FullyRemoved),
            "PACKAGE_REPLACED" => Some(Self::Replaced),
            "PACKAGE_CHANGED" => Some(Self::Changed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEvent {
    pub kind: EventKind,
    pub identifier: String,
    pub replacing: bool,
}

impl PackageEvent {
    pub fn new(kind: EventKind, identifier: &str, replacing: bool) -> Self {
        Self {
            kind,
            identifier: identifier.to_string(),
            replacing,
        }
    }

    pub fn added(identifier: &str) -> Self {
        Self::new(EventKind::Added, identifier, false)
    }

    pub fn removed(identifier: &str) -> Self {
        Self::new(EventKind::Removed, identifier, false)
    }

    pub fn changed(identifier: &str) -> Self {
        Self::new(EventKind::Changed, identifier, false)
    }

    /// Parses a package broadcast (`PACKAGE_ADDED` + `package:<id>`).
    /// Anything outside the `package:` scheme or with an unknown action is
    /// not a lifecycle event and yields `None`.
    pub fn from_broadcast(action: &str, data_uri: &str, replacing: bool) -> Option<Self> {
        let kind = EventKind::from_action(action.trim())?;
        let (scheme, identifier) = data_uri.trim().split_once(':')?;
        if scheme != PACKAGE_SCHEME {
            return None;
        }
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        Some(Self::new(kind, identifier, replacing))
    }
}

/// Cloneable handle the event sources push into. Sending never blocks.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<PackageEvent>,
}

impl EventSink {
    pub fn new(tx: Sender<PackageEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the receiving engine is gone.
    pub fn send(&self, event: PackageEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// A stream of package lifecycle notifications. Delivery is best effort,
/// unordered and at least once.
pub trait EventSource: Send {
    fn source_name(&self) -> &'static str;
    fn register(&mut self, sink: EventSink) -> Result<(), SourceError>;
    fn deregister(&mut self);
}

/// Event source fed by hand, through injectors handed out before or after
/// registration.
#[derive(Default)]
pub struct ChannelEventSource {
    sink: Arc<parking_lot::Mutex<Option<EventSink>>>,
}

#[derive(Clone)]
pub struct EventInjector {
    sink: Arc<parking_lot::Mutex<Option<EventSink>>>,
}

impl EventInjector {
    /// Returns false when no engine is registered to receive the event.
    pub fn inject(&self, event: PackageEvent) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(event),
            None => false,
        }
    }
}

impl ChannelEventSource {
    pub fn injector(&self) -> EventInjector {
        EventInjector {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl EventSource for ChannelEventSource {
    fn source_name(&self) -> &'static str {
        "channel"
    }

    fn register(&mut self, sink: EventSink) -> Result<(), SourceError> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn deregister(&mut self) {
        self.sink.lock().take();
    }
}

/// Polls a package source and turns snapshot differences into events, for
/// hosts without a native package broadcast.
pub struct DesktopEntryWatcher {
    source: Arc<dyn PackageSource>,
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl DesktopEntryWatcher {
    pub fn new(source: Arc<dyn PackageSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            stop_tx: None,
            worker: None,
        }
    }
}

impl EventSource for DesktopEntryWatcher {
    fn source_name(&self) -> &'static str {
        "desktop-entry-watcher"
    }

    fn register(&mut self, sink: EventSink) -> Result<(), SourceError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let baseline = index_by_identifier(self.source.list_all()?);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let source = Arc::clone(&self.source);
        let interval = self.interval;
        let worker = std::thread::Builder::new()
            .name("roster-watcher".to_string())
            .spawn(move || watch_loop(source, interval, baseline, sink, stop_rx))
            .map_err(|error| SourceError::unavailable(format!("failed to spawn watcher: {error}")))?;
        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    fn deregister(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DesktopEntryWatcher {
    fn drop(&mut self) {
        self.deregister();
    }
}

fn watch_loop(
    source: Arc<dyn PackageSource>,
    interval: Duration,
    mut previous: HashMap<String, PackageInfo>,
    sink: EventSink,
    stop_rx: Receiver<()>,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            _ => return,
        }

        let current = match source.list_all() {
            Ok(apps) => index_by_identifier(apps),
            Err(error) => {
                log::warn!("watcher poll failed: {error}");
                continue;
            }
        };

        for event in diff_snapshots(&previous, &current) {
            if !sink.send(event) {
                return;
            }
        }
        previous = current;
    }
}

fn index_by_identifier(apps: Vec<PackageInfo>) -> HashMap<String, PackageInfo> {
    apps.into_iter()
        .map(|app| (app.identifier.clone(), app))
        .collect()
}

pub fn diff_snapshots(
    previous: &HashMap<String, PackageInfo>,
    current: &HashMap<String, PackageInfo>,
) -> Vec<PackageEvent> {
    let mut events = Vec::new();
    for (identifier, info) in current {
        match previous.get(identifier) {
            None => events.push(PackageEvent::added(identifier)),
            Some(old) if old != info => events.push(PackageEvent::changed(identifier)),
            Some(_) => {}
        }
    }
    for identifier in previous.keys() {
        if !current.contains_key(identifier) {
            events.push(PackageEvent::removed(identifier));
        }
    }
    events.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    events
}

#[cfg(test)]
mod tests {
    use super::{diff_snapshots, EventKind, PackageEvent};
    use crate::model::PackageInfo;
    use std::collections::HashMap;

    #[test]
    fn parses_package_scheme_broadcasts() {
        let event = PackageEvent::from_broadcast(
            "android.intent.action.PACKAGE_REPLACED",
            "package:org.maps",
            true,
        )
        .unwrap();
        assert_eq!(event.kind, EventKind::Replaced);
        assert_eq!(event.identifier, "org.maps");
        assert!(event.replacing);

        let removed = PackageEvent::from_broadcast("PACKAGE_FULLY_REMOVED", "package:x", false).unwrap();
        assert!(removed.kind.is_removal());
    }

    #[test]
    fn rejects_other_schemes_and_actions() {
        assert!(PackageEvent::from_broadcast("PACKAGE_ADDED", "file:/tmp/x", false).is_none());
        assert!(PackageEvent::from_broadcast("PACKAGE_ADDED", "package:", false).is_none());
        assert!(PackageEvent::from_broadcast("BOOT_COMPLETED", "package:x", false).is_none());
    }

    #[test]
    fn diff_reports_added_changed_and_removed() {
        let mut previous = HashMap::new();
        previous.insert("a".to_string(), PackageInfo::new("a", "A", ""));
        previous.insert("b".to_string(), PackageInfo::new("b", "B", ""));
        let mut current = HashMap::new();
        current.insert("b".to_string(), PackageInfo::new("b", "B2", ""));
        current.insert("c".to_string(), PackageInfo::new("c", "C", ""));

        let events = diff_snapshots(&previous, &current);
        assert_eq!(
            events,
            vec![
                PackageEvent::removed("a"),
                PackageEvent::changed("b"),
                PackageEvent::added("c"),
            ]
        );
    }
}
