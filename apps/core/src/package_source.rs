use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use thiserror::Error;
use walkdir::WalkDir;

use crate::model::PackageInfo;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("package source unavailable: {0}")]
    Unavailable(String),
    #[error("package not found: {0}")]
    NotFound(String),
    #[error("package source timed out after {0:?}")]
    Timeout(Duration),
    #[error("previous package source call still running")]
    Busy,
}

impl SourceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// The OS view of installed launchable applications. Calls may be slow and
/// are always made off the registry's critical section.
pub trait PackageSource: Send + Sync {
    fn source_name(&self) -> &'static str;
    fn list_all(&self) -> Result<Vec<PackageInfo>, SourceError>;
    fn query(&self, identifier: &str) -> Result<PackageInfo, SourceError>;
}

#[derive(Default)]
pub struct FixedPackageSource {
    apps: RwLock<Vec<PackageInfo>>,
}

impl FixedPackageSource {
    pub fn from_apps(apps: Vec<PackageInfo>) -> Self {
        Self {
            apps: RwLock::new(apps),
        }
    }

    pub fn deterministic_fixture() -> Self {
        Self::from_apps(vec![
            PackageInfo::new("org.gnome.Maps", "Maps", "org.gnome.Maps"),
            PackageInfo::new("org.mozilla.firefox", "Firefox", "firefox"),
            PackageInfo::new("org.gnome.Calculator", "calculator", "accessories-calculator"),
        ])
    }

    pub fn set_apps(&self, apps: Vec<PackageInfo>) {
        *self.apps.write() = apps;
    }

    pub fn upsert(&self, info: PackageInfo) {
        let mut apps = self.apps.write();
        match apps.iter_mut().find(|app| app.identifier == info.identifier) {
            Some(existing) => *existing = info,
            None => apps.push(info),
        }
    }

    pub fn remove(&self, identifier: &str) -> bool {
        let mut apps = self.apps.write();
        let before = apps.len();
        apps.retain(|app| app.identifier != identifier);
        apps.len() != before
    }
}

impl PackageSource for FixedPackageSource {
    fn source_name(&self) -> &'static str {
        "fixed"
    }

    fn list_all(&self) -> Result<Vec<PackageInfo>, SourceError> {
        Ok(self.apps.read().clone())
    }

    fn query(&self, identifier: &str) -> Result<PackageInfo, SourceError> {
        self.apps
            .read()
            .iter()
            .find(|app| app.identifier == identifier)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(identifier.to_string()))
    }
}

/// Enumerates freedesktop `.desktop` entries under a list of application
/// directories. Earlier roots shadow later ones, matching XDG lookup order.
pub struct DesktopEntrySource {
    roots: Vec<PathBuf>,
    max_depth: usize,
}

impl DesktopEntrySource {
    pub fn new(roots: Vec<PathBuf>, max_depth: usize) -> Self {
        Self {
            roots,
            max_depth: max_depth.max(1),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn entry_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for root in &self.roots {
            if !root.is_dir() {
                continue;
            }
            for entry in WalkDir::new(root)
                .follow_links(true)
                .max_depth(self.max_depth)
                .sort_by_file_name()
            {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(error) => {
                        log::warn!("skipping unreadable application dir entry: {error}");
                        continue;
                    }
                };
                if entry.file_type().is_file() && is_desktop_file(entry.path()) {
                    paths.push(entry.into_path());
                }
            }
        }
        paths
    }
}

impl PackageSource for DesktopEntrySource {
    fn source_name(&self) -> &'static str {
        "desktop-entries"
    }

    fn list_all(&self) -> Result<Vec<PackageInfo>, SourceError> {
        if !self.roots.iter().any(|root| root.is_dir()) {
            return Err(SourceError::unavailable(
                "no application directory is readable",
            ));
        }

        let mut seen = HashSet::new();
        let mut apps = Vec::new();
        for path in self.entry_paths() {
            let Some(identifier) = desktop_identifier(&path) else {
                continue;
            };
            if seen.contains(&identifier) {
                continue;
            }
            match read_desktop_entry(&path, &identifier) {
                Ok(Some(info)) => {
                    seen.insert(identifier);
                    apps.push(info);
                }
                Ok(None) => {
                    seen.insert(identifier);
                }
                Err(error) => {
                    log::warn!("skipping desktop entry {}: {error}", path.display());
                }
            }
        }
        Ok(apps)
    }

    fn query(&self, identifier: &str) -> Result<PackageInfo, SourceError> {
        for path in self.entry_paths() {
            if desktop_identifier(&path).as_deref() != Some(identifier) {
                continue;
            }
            return match read_desktop_entry(&path, identifier) {
                Ok(Some(info)) => Ok(info),
                Ok(None) => Err(SourceError::NotFound(identifier.to_string())),
                Err(error) => Err(SourceError::unavailable(format!(
                    "failed to read {}: {error}",
                    path.display()
                ))),
            };
        }
        Err(SourceError::NotFound(identifier.to_string()))
    }
}

fn is_desktop_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("desktop"))
        .unwrap_or(false)
}

fn desktop_identifier(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::trim)
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

/// `Ok(None)` means the entry exists but is not a visible application.
fn read_desktop_entry(path: &Path, identifier: &str) -> Result<Option<PackageInfo>, std::io::Error> {
    let raw = std::fs::read_to_string(path)?;
    Ok(parse_desktop_entry(&raw, identifier))
}

pub fn parse_desktop_entry(raw: &str, identifier: &str) -> Option<PackageInfo> {
    let mut in_main_group = false;
    let mut name = None;
    let mut icon = None;
    let mut kind = None;
    let mut hidden = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            in_main_group = line == "[Desktop Entry]";
            continue;
        }
        if !in_main_group {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" => name = Some(value.to_string()),
            "Icon" => icon = Some(value.to_string()),
            "Type" => kind = Some(value.to_string()),
            "NoDisplay" | "Hidden" => hidden |= value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }

    if hidden || kind.as_deref() != Some("Application") {
        return None;
    }
    let name = name.filter(|name| !name.is_empty())?;
    Some(PackageInfo {
        identifier: identifier.to_string(),
        display_name: name,
        icon_ref: icon.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::parse_desktop_entry;

    #[test]
    fn parses_visible_application() {
        let raw = "[Desktop Entry]\nType=Application\nName=Maps\nName[de]=Karten\nIcon=org.gnome.Maps\n";
        let info = parse_desktop_entry(raw, "org.gnome.Maps").unwrap();
        assert_eq!(info.display_name, "Maps");
        assert_eq!(info.icon_ref, "org.gnome.Maps");
    }

    #[test]
    fn ignores_keys_outside_main_group() {
        let raw = "[Desktop Action new]\nName=New Window\n[Desktop Entry]\nType=Application\nName=Firefox\n";
        let info = parse_desktop_entry(raw, "firefox").unwrap();
        assert_eq!(info.display_name, "Firefox");
        assert_eq!(info.icon_ref, "");
    }

    #[test]
    fn hidden_and_non_application_entries_are_skipped() {
        assert!(parse_desktop_entry("[Desktop Entry]\nType=Application\nName=X\nNoDisplay=true\n", "x").is_none());
        assert!(parse_desktop_entry("[Desktop Entry]\nType=Link\nName=X\n", "x").is_none());
        assert!(parse_desktop_entry("[Desktop Entry]\nType=Application\n", "x").is_none());
    }
}
