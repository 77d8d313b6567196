use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired<K, A> {
    /// The coalescing window for `key` elapsed; `action` is the last one pushed.
    Key(K, A),
    /// A full reload is due, either because a burst settled or because one
    /// was scheduled explicitly.
    Reload,
}

#[derive(Debug, Clone)]
struct KeyTimer<A> {
    deadline: Instant,
    action: A,
    merged: u32,
}

/// Per-key cancellable timers plus one burst timer, driven by an external
/// clock. The caller owns the thread and passes `now` in.
#[derive(Debug, Clone)]
pub struct Debouncer<K, A> {
    coalesce: Duration,
    settle: Duration,
    keys: HashMap<K, KeyTimer<A>>,
    burst_deadline: Option<Instant>,
    reload_deadline: Option<Instant>,
}

impl<K, A> Debouncer<K, A>
where
    K: Eq + Hash + Clone,
{
    pub fn new(coalesce: Duration, settle: Duration) -> Self {
        Self {
            coalesce,
            settle: settle.max(coalesce),
            keys: HashMap::new(),
            burst_deadline: None,
            reload_deadline: None,
        }
    }

    /// Restarts the key's timer with `action` replacing whatever was pending
    /// and pushes the burst deadline out. Returns how many earlier pushes the
    /// pending action now stands for.
    pub fn push(&mut self, key: K, action: A, now: Instant) -> u32 {
        let deadline = now + self.coalesce;
        let merged = match self.keys.get_mut(&key) {
            Some(timer) => {
                timer.deadline = deadline;
                timer.action = action;
                timer.merged += 1;
                timer.merged
            }
            None => {
                self.keys.insert(
                    key,
                    KeyTimer {
                        deadline,
                        action,
                        merged: 0,
                    },
                );
                0
            }
        };
        self.burst_deadline = Some(now + self.settle);
        merged
    }

    /// Asks for a reload at `at`; an earlier pending request wins.
    pub fn schedule_reload(&mut self, at: Instant) {
        self.reload_deadline = Some(match self.reload_deadline {
            Some(existing) => existing.min(at),
            None => at,
        });
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        self.keys.remove(key).is_some()
    }

    pub fn pending_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn is_idle(&self) -> bool {
        self.keys.is_empty() && self.burst_deadline.is_none() && self.reload_deadline.is_none()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.keys
            .values()
            .map(|timer| timer.deadline)
            .chain(self.burst_deadline)
            .chain(self.reload_deadline)
            .min()
    }

    /// Fires everything due at `now`. Key timers fire first; the trailing
    /// reconcile waits until no key timer is pending so it observes their
    /// effects. A due explicit reload and a due reconcile fire once.
    pub fn poll(&mut self, now: Instant) -> Vec<Fired<K, A>> {
        let mut due: Vec<(Instant, K)> = self
            .keys
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(key, timer)| (timer.deadline, key.clone()))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        let mut fired = Vec::with_capacity(due.len() + 1);
        for (_, key) in due {
            if let Some(timer) = self.keys.remove(&key) {
                fired.push(Fired::Key(key, timer.action));
            }
        }

        let burst_due = self.keys.is_empty() && self.burst_deadline.is_some_and(|d| d <= now);
        let reload_due = self.reload_deadline.is_some_and(|d| d <= now);
        if burst_due {
            self.burst_deadline = None;
        }
        if reload_due {
            self.reload_deadline = None;
        }
        if burst_due || reload_due {
            fired.push(Fired::Reload);
        }
        fired
    }

    pub fn clear(&mut self) {
        self.keys.clear();
        self.burst_deadline = None;
        self.reload_deadline = None;
    }
}
