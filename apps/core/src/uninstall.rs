use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::UninstallCommand;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum UninstallError {
    #[error("no uninstall handler configured")]
    NotConfigured,
    #[error("empty identifier")]
    EmptyIdentifier,
    #[error("failed to launch uninstaller for '{identifier}': {source}")]
    Launch {
        identifier: String,
        source: std::io::Error,
    },
}

/// Hands an identifier to the OS uninstall flow. Completion is never
/// observed here: it is inferred from removal events or the grace heuristic.
pub trait UninstallRequester: Send + Sync {
    fn request_uninstall(&self, identifier: &str) -> Result<(), UninstallError>;
}

pub struct CommandUninstaller {
    command: UninstallCommand,
}

impl CommandUninstaller {
    pub fn new(command: UninstallCommand) -> Self {
        Self { command }
    }

    pub fn rendered_args(&self, identifier: &str) -> Vec<String> {
        self.command
            .args
            .iter()
            .map(|arg| arg.replace("{id}", identifier))
            .collect()
    }
}

impl UninstallRequester for CommandUninstaller {
    fn request_uninstall(&self, identifier: &str) -> Result<(), UninstallError> {
        if identifier.trim().is_empty() {
            return Err(UninstallError::EmptyIdentifier);
        }
        Command::new(&self.command.program)
            .args(self.rendered_args(identifier))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_child| ())
            .map_err(|source| UninstallError::Launch {
                identifier: identifier.to_string(),
                source,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallResolution {
    /// Nothing overdue.
    Settled,
    /// An uninstall outlived the grace period; reconcile with a full load.
    ForceReload,
    /// A forced load already failed to settle it; drop state and reload.
    Reset,
}

#[derive(Debug, Clone, Copy)]
struct PendingUninstall {
    started_at: Instant,
    forced_reloads: u32,
}

/// Uninstalls launched from the launcher whose terminating removal event has
/// not arrived yet.
#[derive(Debug, Clone)]
pub struct UninstallTracker {
    grace: Duration,
    pending: HashMap<String, PendingUninstall>,
}

impl Default for UninstallTracker {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl UninstallTracker {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            pending: HashMap::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn begin(&mut self, identifier: &str, now: Instant) {
        self.pending.insert(
            identifier.to_string(),
            PendingUninstall {
                started_at: now,
                forced_reloads: 0,
            },
        );
    }

    pub fn clear(&mut self, identifier: &str) -> bool {
        self.pending.remove(identifier).is_some()
    }

    pub fn clear_all(&mut self) {
        self.pending.clear();
    }

    /// Drops entries whose identifier a fresh load no longer reports.
    pub fn retain_present<F>(&mut self, mut is_present: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.pending.retain(|identifier, _| is_present(identifier));
    }

    pub fn is_tracking(&self, identifier: &str) -> bool {
        self.pending.contains_key(identifier)
    }

    pub fn pending_identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn started_at(&self, identifier: &str) -> Option<Instant> {
        self.pending.get(identifier).map(|entry| entry.started_at)
    }

    pub fn resolve(&mut self, now: Instant) -> UninstallResolution {
        let grace = self.grace;
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.started_at) > grace)
            .map(|(identifier, _)| identifier.clone())
            .collect();

        if overdue.is_empty() {
            return UninstallResolution::Settled;
        }

        let escalate = overdue
            .iter()
            .any(|identifier| self.pending[identifier].forced_reloads > 0);
        if escalate {
            for identifier in &overdue {
                self.pending.remove(identifier);
            }
            return UninstallResolution::Reset;
        }

        for identifier in &overdue {
            if let Some(entry) = self.pending.get_mut(identifier) {
                entry.forced_reloads += 1;
            }
        }
        UninstallResolution::ForceReload
    }
}
