use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use crate::event_source::{EventKind, PackageEvent};
use crate::model::{compare_records, ApplicationRecord, PackageInfo};
use crate::pin_store::PinnedSet;
use crate::uninstall::{UninstallResolution, UninstallTracker};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
}

/// Immutable view of the registry at one committed version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Snapshot {
    version: u64,
    initialized: bool,
    records: Vec<ApplicationRecord>,
}

impl Snapshot {
    pub fn from_records(mut records: Vec<ApplicationRecord>) -> Self {
        records.sort_by(compare_records);
        Self {
            version: 0,
            initialized: true,
            records,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Records in "all apps" order.
    pub fn records(&self) -> &[ApplicationRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identifier: &str) -> Option<&ApplicationRecord> {
        self.records.iter().find(|record| record.identifier() == identifier)
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.records
            .iter()
            .map(|record| record.identifier())
            .collect()
    }

    pub fn pinned_identifiers(&self) -> PinnedSet {
        self.records
            .iter()
            .filter(|record| record.pinned)
            .map(|record| record.identifier().to_string())
            .collect()
    }
}

/// What an incremental event asks the caller to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    /// Part of an update or otherwise irrelevant.
    Ignored,
    /// The record was deleted. `pins` is the set to persist when the
    /// identifier had been pinned.
    Removed { pins: Option<PinnedSet> },
    /// Name or icon may be stale: re-query this identifier.
    Refresh(String),
    /// Event referred to nothing the registry holds.
    Inconsistent,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub snapshot: Arc<Snapshot>,
    /// Pinned set pruned of identifiers the load no longer reports.
    pub pins_to_persist: Option<PinnedSet>,
}

#[derive(Debug, Clone)]
pub struct PinToggled {
    pub identifier: String,
    pub pinned: bool,
    pub pins: PinnedSet,
    pub snapshot: Arc<Snapshot>,
}

struct RegistryState {
    records: HashMap<String, ApplicationRecord>,
    snapshot: Arc<Snapshot>,
    version: u64,
    initialized: bool,
    persisted_pins: PinnedSet,
    uninstalls: UninstallTracker,
    current_query: String,
}

impl RegistryState {
    fn commit(&mut self) -> Arc<Snapshot> {
        self.version += 1;
        let mut records: Vec<ApplicationRecord> = self.records.values().cloned().collect();
        records.sort_by(compare_records);
        self.snapshot = Arc::new(Snapshot {
            version: self.version,
            initialized: self.initialized,
            records,
        });
        Arc::clone(&self.snapshot)
    }

    fn pinned_now(&self) -> PinnedSet {
        self.records
            .values()
            .filter(|record| record.pinned)
            .map(|record| record.identifier().to_string())
            .collect()
    }

    fn pinned_for_new(&self, identifier: &str) -> bool {
        self.persisted_pins.contains(identifier)
    }
}

#[derive(Default)]
struct SubscriberList {
    entries: Vec<(SubscriptionId, Sender<Arc<Snapshot>>)>,
    last_delivered: u64,
}

/// The canonical application list. All mutations serialize on one lock;
/// readers get `Arc<Snapshot>` values and never see a partial update.
/// Subscribers are notified after the lock is released.
pub struct Registry {
    state: Mutex<RegistryState>,
    subscribers: Arc<Mutex<SubscriberList>>,
    next_subscription: AtomicU64,
    self_identifier: Option<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(None, PinnedSet::new(), crate::uninstall::DEFAULT_GRACE_PERIOD)
    }
}

impl Registry {
    pub fn new(self_identifier: Option<String>, persisted_pins: PinnedSet, grace: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                records: HashMap::new(),
                snapshot: Arc::new(Snapshot::default()),
                version: 0,
                initialized: false,
                persisted_pins,
                uninstalls: UninstallTracker::new(grace),
                current_query: String::new(),
            }),
            subscribers: Arc::new(Mutex::new(SubscriberList::default())),
            next_subscription: AtomicU64::new(1),
            self_identifier: self_identifier.filter(|id| !id.trim().is_empty()),
        }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.state.lock().snapshot)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn is_self(&self, identifier: &str) -> bool {
        self.self_identifier.as_deref() == Some(identifier)
    }

    /// Replaces the record set. Pins survive for known identifiers and come
    /// from the persisted set for new ones. Always notifies, even when
    /// nothing changed.
    pub fn load(&self, apps: Vec<PackageInfo>) -> LoadOutcome {
        let (snapshot, pins_to_persist) = {
            let mut state = self.state.lock();
            let mut next = HashMap::with_capacity(apps.len());
            for info in apps {
                if info.identifier.trim().is_empty() || self.is_self(&info.identifier) {
                    continue;
                }
                let pinned = match state.records.get(&info.identifier) {
                    Some(existing) => existing.pinned,
                    None => state.pinned_for_new(&info.identifier),
                };
                next.insert(
                    info.identifier.clone(),
                    ApplicationRecord::from_info(info, pinned),
                );
            }

            let dropped = state
                .records
                .keys()
                .filter(|identifier| !next.contains_key(*identifier))
                .count();
            state.records = next;
            state.initialized = true;

            let RegistryState {
                records, uninstalls, ..
            } = &mut *state;
            uninstalls.retain_present(|identifier| records.contains_key(identifier));

            // An empty enumeration is more likely a broken source than a
            // device with no apps; keep the persisted pins in that case.
            let pinned = state.pinned_now();
            let pins_to_persist = if !state.records.is_empty() && pinned != state.persisted_pins {
                Some(pinned)
            } else {
                None
            };

            log::debug!(
                "registry load: {} records, {dropped} dropped",
                state.records.len()
            );
            (state.commit(), pins_to_persist)
        };

        self.publish(Arc::clone(&snapshot));
        LoadOutcome {
            snapshot,
            pins_to_persist,
        }
    }

    /// Applies a targeted re-query result. Returns true when the record set
    /// changed.
    pub fn upsert(&self, info: PackageInfo) -> bool {
        if self.is_self(&info.identifier) {
            return false;
        }
        let snapshot = {
            let mut state = self.state.lock();
            let changed = match state.records.get_mut(&info.identifier) {
                Some(existing) => existing.refresh_from(info),
                None => {
                    let pinned = state.pinned_for_new(&info.identifier);
                    let record = ApplicationRecord::from_info(info, pinned);
                    state.records.insert(record.identifier().to_string(), record);
                    true
                }
            };
            if !changed {
                return false;
            }
            state.commit()
        };
        self.publish(snapshot);
        true
    }

    pub fn apply_event(&self, event: &PackageEvent) -> EventEffect {
        if self.is_self(&event.identifier) {
            return EventEffect::Ignored;
        }

        match event.kind {
            EventKind::Added if event.replacing => EventEffect::Ignored,
            kind if kind.is_removal() && event.replacing => EventEffect::Ignored,
            kind if kind.is_removal() => self.remove(&event.identifier),
            EventKind::Added | EventKind::Replaced | EventKind::Changed => {
                EventEffect::Refresh(event.identifier.clone())
            }
            _ => EventEffect::Ignored,
        }
    }

    fn remove(&self, identifier: &str) -> EventEffect {
        let (snapshot, pins) = {
            let mut state = self.state.lock();
            state.uninstalls.clear(identifier);
            let Some(removed) = state.records.remove(identifier) else {
                log::debug!("removal for absent identifier {identifier} ignored");
                return EventEffect::Inconsistent;
            };
            let pins = if removed.pinned || state.persisted_pins.contains(identifier) {
                let mut pins = state.pinned_now();
                pins.remove(identifier);
                Some(pins)
            } else {
                None
            };
            (state.commit(), pins)
        };
        self.publish(snapshot);
        EventEffect::Removed { pins }
    }

    pub fn toggle_pin(&self, identifier: &str) -> Result<PinToggled, RegistryError> {
        let toggled = {
            let mut state = self.state.lock();
            let record = state
                .records
                .get_mut(identifier)
                .ok_or_else(|| RegistryError::UnknownIdentifier(identifier.to_string()))?;
            record.pinned = !record.pinned;
            let pinned = record.pinned;
            let pins = state.pinned_now();
            PinToggled {
                identifier: identifier.to_string(),
                pinned,
                pins,
                snapshot: state.commit(),
            }
        };
        self.publish(Arc::clone(&toggled.snapshot));
        Ok(toggled)
    }

    /// Records that `pins` reached durable storage.
    pub fn record_persisted(&self, pins: PinnedSet) {
        self.state.lock().persisted_pins = pins;
    }

    pub fn persisted_pins(&self) -> PinnedSet {
        self.state.lock().persisted_pins.clone()
    }

    /// Takes `stored` as the durable pin set and pins every present record it
    /// names. Pins made in memory meanwhile are kept.
    pub fn adopt_persisted(&self, stored: PinnedSet) {
        let snapshot = {
            let mut state = self.state.lock();
            let mut changed = false;
            for identifier in &stored {
                if let Some(record) = state.records.get_mut(identifier) {
                    if !record.pinned {
                        record.pinned = true;
                        changed = true;
                    }
                }
            }
            state.persisted_pins = stored;
            if !changed {
                return;
            }
            state.commit()
        };
        self.publish(snapshot);
    }

    /// The set a pin write should store right now, or `None` before the
    /// first load when there is nothing authoritative to write.
    pub fn pins_to_write(&self) -> Option<PinnedSet> {
        let state = self.state.lock();
        state.initialized.then(|| state.pinned_now())
    }

    /// Drops every record and tracking entry. The next load starts over.
    pub fn reset(&self) {
        let snapshot = {
            let mut state = self.state.lock();
            state.records.clear();
            state.uninstalls.clear_all();
            state.initialized = false;
            state.commit()
        };
        self.publish(snapshot);
    }

    pub fn begin_uninstall_tracking(&self, identifier: &str) {
        self.begin_uninstall_tracking_at(identifier, Instant::now());
    }

    pub fn begin_uninstall_tracking_at(&self, identifier: &str, now: Instant) {
        self.state.lock().uninstalls.begin(identifier, now);
    }

    pub fn cancel_uninstall_tracking(&self, identifier: &str) -> bool {
        self.state.lock().uninstalls.clear(identifier)
    }

    pub fn resolve_uninstall_tracking(&self) -> UninstallResolution {
        self.resolve_uninstall_tracking_at(Instant::now())
    }

    pub fn resolve_uninstall_tracking_at(&self, now: Instant) -> UninstallResolution {
        self.state.lock().uninstalls.resolve(now)
    }

    pub fn pending_uninstalls(&self) -> Vec<String> {
        self.state.lock().uninstalls.pending_identifiers()
    }

    pub fn set_query(&self, query: &str) {
        self.state.lock().current_query = query.to_string();
    }

    pub fn current_query(&self) -> String {
        self.state.lock().current_query.clone()
    }

    /// Registers a subscriber. Each committed mutation pushes the new
    /// snapshot to it until it unsubscribes or is dropped.
    pub fn observe(&self) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.lock().entries.push((id, tx));
        Subscription {
            id,
            rx,
            active: AtomicBool::new(true),
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Idempotent: unknown or already removed ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        remove_subscriber(&self.subscribers, id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    fn publish(&self, snapshot: Arc<Snapshot>) {
        let mut subscribers = self.subscribers.lock();
        // A concurrent mutation may have delivered a newer version already.
        if snapshot.version <= subscribers.last_delivered {
            return;
        }
        subscribers.last_delivered = snapshot.version;
        subscribers
            .entries
            .retain(|(_, tx)| tx.send(Arc::clone(&snapshot)).is_ok());
    }
}

fn remove_subscriber(subscribers: &Mutex<SubscriberList>, id: SubscriptionId) {
    subscribers.lock().entries.retain(|(entry_id, _)| *entry_id != id);
}

/// Receiving end of a registry subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: Receiver<Arc<Snapshot>>,
    active: AtomicBool,
    subscribers: Weak<Mutex<SubscriberList>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn try_recv(&self) -> Option<Arc<Snapshot>> {
        if !self.is_active() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<Snapshot>> {
        if !self.is_active() {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(snapshot) => Some(snapshot),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drains queued notifications and returns the newest one.
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        let mut newest = None;
        while let Some(snapshot) = self.try_recv() {
            newest = Some(snapshot);
        }
        newest
    }

    /// Waits until a snapshot satisfying `predicate` arrives.
    pub fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Option<Arc<Snapshot>>
    where
        F: FnMut(&Snapshot) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let snapshot = self.recv_timeout(remaining)?;
            if predicate(&snapshot) {
                return Some(snapshot);
            }
        }
    }

    /// Idempotent. Notifications queued before the call are discarded.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(subscribers) = self.subscribers.upgrade() {
            remove_subscriber(&subscribers, self.id);
        }
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
