use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// What a package source reports for one launchable application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
    pub identifier: String,
    pub display_name: String,
    pub icon_ref: String,
}

impl PackageInfo {
    pub fn new(identifier: &str, display_name: &str, icon_ref: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            display_name: display_name.to_string(),
            icon_ref: icon_ref.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A launchable entry as the registry holds it. Name fields are read-only so
/// the cached sort key cannot drift from the display name.
pub struct ApplicationRecord {
    identifier: String,
    display_name: String,
    icon_ref: String,
    pub pinned: bool,
    sort_name: String,
}

impl ApplicationRecord {
    pub fn new(identifier: &str, display_name: &str, icon_ref: &str, pinned: bool) -> Self {
        Self::from_info(PackageInfo::new(identifier, display_name, icon_ref), pinned)
    }

    pub fn from_info(info: PackageInfo, pinned: bool) -> Self {
        let sort_name = fold_case(&info.display_name);
        Self {
            identifier: info.identifier,
            display_name: info.display_name,
            icon_ref: info.icon_ref,
            pinned,
            sort_name,
        }
    }

    /// Refreshes name and icon from a newer report. Identity and pin survive.
    pub fn refresh_from(&mut self, info: PackageInfo) -> bool {
        if self.display_name == info.display_name && self.icon_ref == info.icon_ref {
            return false;
        }
        self.sort_name = fold_case(&info.display_name);
        self.display_name = info.display_name;
        self.icon_ref = info.icon_ref;
        true
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn icon_ref(&self) -> &str {
        &self.icon_ref
    }

    pub fn folded_name(&self) -> &str {
        &self.sort_name
    }
}

/// "All apps" order: case-insensitive display name, ties broken by identifier.
pub fn compare_records(left: &ApplicationRecord, right: &ApplicationRecord) -> Ordering {
    left.folded_name()
        .cmp(right.folded_name())
        .then_with(|| left.identifier.cmp(&right.identifier))
}

pub fn fold_case(input: &str) -> String {
    input.chars().flat_map(|c| c.to_lowercase()).collect()
}
