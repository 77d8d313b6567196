use serde::{Deserialize, Serialize};

use crate::engine::EngineStatus;
use crate::model::ApplicationRecord;
use crate::search::{letter_positions, LetterGroup};
use crate::uninstall::UninstallResolution;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRequest {
    /// Replaces the remembered query when present.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub pinned_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupsRequest {
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifierRequest {
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordDto {
    pub identifier: String,
    pub display_name: String,
    pub icon_ref: String,
    pub pinned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListResponse {
    pub version: u64,
    pub query: String,
    pub records: Vec<RecordDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupDto {
    pub letter: String,
    pub position: usize,
    pub records: Vec<RecordDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupsResponse {
    pub version: u64,
    pub groups: Vec<GroupDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinResponse {
    pub identifier: String,
    pub pinned: bool,
    pub persisted: bool,
    /// Set when the pin holds in memory but may not survive a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeResponse {
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub version: u64,
    pub initialized: bool,
    pub records: usize,
    pub pinned: usize,
    pub paused: bool,
    pub query: String,
    pub pending_uninstalls: Vec<String>,
    pub full_loads: u64,
    pub failed_loads: u64,
    pub queries: u64,
    pub pin_writes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload")]
pub enum CoreRequest {
    List(ListRequest),
    Groups(GroupsRequest),
    TogglePin(IdentifierRequest),
    Reload,
    Uninstall(IdentifierRequest),
    Pause,
    Resume,
    Status,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload")]
pub enum CoreResponse {
    List(ListResponse),
    Groups(GroupsResponse),
    TogglePin(PinResponse),
    Accepted,
    Resume(ResumeResponse),
    Status(StatusResponse),
}

impl From<&ApplicationRecord> for RecordDto {
    fn from(value: &ApplicationRecord) -> Self {
        Self {
            identifier: value.identifier().to_string(),
            display_name: value.display_name().to_string(),
            icon_ref: value.icon_ref().to_string(),
            pinned: value.pinned,
        }
    }
}

pub fn records_to_dtos(records: &[ApplicationRecord]) -> Vec<RecordDto> {
    records.iter().map(RecordDto::from).collect()
}

pub fn groups_to_dtos(groups: &[LetterGroup]) -> Vec<GroupDto> {
    groups
        .iter()
        .zip(letter_positions(groups))
        .map(|(group, (_, position))| GroupDto {
            letter: group.letter.clone(),
            position,
            records: records_to_dtos(&group.records),
        })
        .collect()
}

impl From<UninstallResolution> for ResumeResponse {
    fn from(value: UninstallResolution) -> Self {
        let resolution = match value {
            UninstallResolution::Settled => "settled",
            UninstallResolution::ForceReload => "force_reload",
            UninstallResolution::Reset => "reset",
        };
        Self {
            resolution: resolution.to_string(),
        }
    }
}

impl From<EngineStatus> for StatusResponse {
    fn from(value: EngineStatus) -> Self {
        Self {
            version: value.version,
            initialized: value.initialized,
            records: value.records,
            pinned: value.pinned,
            paused: value.paused,
            query: value.query,
            pending_uninstalls: value.pending_uninstalls,
            full_loads: value.counters.full_loads,
            failed_loads: value.counters.failed_loads,
            queries: value.counters.queries,
            pin_writes: value.counters.pin_writes,
        }
    }
}
