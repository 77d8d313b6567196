use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

const LOG_FILE_NAME: &str = "roster.log";
const ARCHIVE_PREFIX: &str = "roster-";
const MAX_LOG_BYTES: u64 = 1_000_000;
const MAX_ARCHIVES: usize = 5;

static LOGGER: OnceLock<FileLogger> = OnceLock::new();
static PANIC_HOOK_INSTALLED: OnceLock<()> = OnceLock::new();

struct FileLogger {
    file: Mutex<File>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(now_secs(), record);
        let mut file = self.file.lock();
        let _ = file.write_all(line.as_bytes());
        let _ = file.flush();
    }

    fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

pub fn logs_dir() -> PathBuf {
    crate::config::stable_app_data_dir().join("logs")
}

/// Installs the rotating file sink as the global `log` backend.
/// Calling it again only adjusts the level.
pub fn init(level: LevelFilter) -> Result<(), std::io::Error> {
    init_in(&logs_dir(), level)
}

pub fn init_in(log_dir: &Path, level: LevelFilter) -> Result<(), std::io::Error> {
    log::set_max_level(level);
    if LOGGER.get().is_some() {
        return Ok(());
    }

    fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_if_needed(&log_path, log_dir)?;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let logger = LOGGER.get_or_init(|| FileLogger {
        file: Mutex::new(file),
    });
    // Another logger may already be installed (tests, embedding hosts).
    let _ = log::set_logger(logger);

    install_panic_hook();
    Ok(())
}

fn format_line(ts: u64, record: &Record<'_>) -> String {
    format!(
        "[{ts}] [{}] {}: {}\n",
        record.level(),
        record.target(),
        record.args()
    )
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Moves an oversized log aside as `roster-<epoch>.log`.
fn rotate_if_needed(log_path: &Path, log_dir: &Path) -> Result<(), std::io::Error> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(error) => return Err(error),
    };
    if size < MAX_LOG_BYTES {
        return Ok(());
    }

    fs::rename(log_path, log_dir.join(format!("{ARCHIVE_PREFIX}{}.log", now_secs())))?;
    prune_old_archives(log_dir)
}

fn archive_stamp(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(ARCHIVE_PREFIX)?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// Keeps the newest `MAX_ARCHIVES` archives by embedded timestamp.
fn prune_old_archives(log_dir: &Path) -> Result<(), std::io::Error> {
    let mut archives: Vec<(u64, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter_map(|path| archive_stamp(&path).map(|stamp| (stamp, path)))
        .collect();
    if archives.len() <= MAX_ARCHIVES {
        return Ok(());
    }

    archives.sort_by_key(|(stamp, _)| std::cmp::Reverse(*stamp));
    for (_, stale) in archives.drain(MAX_ARCHIVES..) {
        if let Err(error) = fs::remove_file(&stale) {
            log::debug!("could not prune {}: {error}", stale.display());
        }
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    payload
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Forwards panics to the log, then to whatever hook was there before.
fn install_panic_hook() {
    PANIC_HOOK_INSTALLED.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|at| format!("{}:{}", at.file(), at.line()))
                .unwrap_or_else(|| "<unknown>".to_string());
            log::error!("panic at {location}: {}", panic_message(info.payload()));
            previous(info);
        }));
    });
}

#[cfg(test)]
mod tests {
    use super::{format_line, logs_dir, prune_old_archives, rotate_if_needed};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(label: &str) -> std::path::PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("roster-logging-{label}-{unique}"));
        std::fs::create_dir_all(&dir).expect("scratch dir should be created");
        dir
    }

    #[test]
    fn logs_dir_uses_stable_app_data_layout() {
        let dir = logs_dir();
        assert!(dir.to_string_lossy().to_ascii_lowercase().contains("roster"));
    }

    #[test]
    fn line_carries_level_and_target() {
        let line = format_line(
            42,
            &log::Record::builder()
                .args(format_args!("reload finished"))
                .level(log::Level::Warn)
                .target("roster_core::engine")
                .build(),
        );
        assert_eq!(line, "[42] [WARN] roster_core::engine: reload finished\n");
    }

    #[test]
    fn oversized_log_is_archived() {
        let dir = scratch_dir("rotate");
        let log_path = dir.join("roster.log");
        std::fs::write(&log_path, vec![b'x'; 1_000_001]).unwrap();

        rotate_if_needed(&log_path, &dir).unwrap();

        assert!(!log_path.exists());
        let archived = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(archived, 1);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn prune_keeps_newest_archives() {
        let dir = scratch_dir("prune");
        for stamp in 0..8 {
            std::fs::write(dir.join(format!("roster-{stamp:04}.log")), b"old").unwrap();
        }

        prune_old_archives(&dir).unwrap();

        let mut left: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), 5);
        assert_eq!(left[0], "roster-0003.log");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
