use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contract::{
    groups_to_dtos, records_to_dtos, CoreRequest, CoreResponse, GroupsResponse, ListResponse,
    PinResponse,
};
use crate::engine::{EngineError, SyncEngine};
use crate::registry::RegistryError;
use crate::search::SearchIndex;

/// How long a pin toggle waits for its write before answering anyway.
pub const PERSIST_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidJson,
    UnknownIdentifier,
    Uninstall,
    Stopped,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransportResponse {
    Ok { response: CoreResponse },
    Err { error: ErrorResponse },
}

pub fn handle_request(engine: &SyncEngine, request: CoreRequest) -> TransportResponse {
    match dispatch(engine, request) {
        Ok(response) => TransportResponse::Ok { response },
        Err(error) => TransportResponse::Err {
            error: map_engine_error(error),
        },
    }
}

pub fn handle_json(engine: &SyncEngine, payload: &str) -> String {
    let response = match serde_json::from_str::<CoreRequest>(payload) {
        Ok(request) => handle_request(engine, request),
        Err(error) => TransportResponse::Err {
            error: ErrorResponse {
                code: ErrorCode::InvalidJson,
                message: error.to_string(),
            },
        },
    };

    serde_json::to_string(&response).unwrap_or_else(|error| {
        format!(
            "{{\"status\":\"err\",\"error\":{{\"code\":\"internal\",\"message\":{}}}}}",
            serde_json::Value::String(error.to_string())
        )
    })
}

fn dispatch(engine: &SyncEngine, request: CoreRequest) -> Result<CoreResponse, EngineError> {
    match request {
        CoreRequest::List(list) => {
            let index = index_for(engine, list.query);
            let snapshot = engine.snapshot();
            Ok(CoreResponse::List(ListResponse {
                version: snapshot.version(),
                query: index.query().to_string(),
                records: records_to_dtos(&index.filtered(&snapshot, list.pinned_only)),
            }))
        }
        CoreRequest::Groups(groups) => {
            let index = index_for(engine, groups.query);
            let snapshot = engine.snapshot();
            Ok(CoreResponse::Groups(GroupsResponse {
                version: snapshot.version(),
                groups: groups_to_dtos(&index.grouped(&snapshot)),
            }))
        }
        CoreRequest::TogglePin(pin) => {
            let toggle = engine.toggle_pin(&pin.identifier)?;
            let (persisted, warning) = match toggle.wait_persisted(PERSIST_WAIT) {
                Some(Ok(())) => (true, None),
                Some(Err(error)) => (false, Some(format!("pin may not survive restart: {error}"))),
                None => (false, Some("pin write still pending".to_string())),
            };
            Ok(CoreResponse::TogglePin(PinResponse {
                identifier: toggle.identifier,
                pinned: toggle.pinned,
                persisted,
                warning,
            }))
        }
        CoreRequest::Reload => {
            engine.reload()?;
            Ok(CoreResponse::Accepted)
        }
        CoreRequest::Uninstall(target) => {
            engine.uninstall(&target.identifier)?;
            Ok(CoreResponse::Accepted)
        }
        CoreRequest::Pause => {
            engine.pause();
            Ok(CoreResponse::Accepted)
        }
        CoreRequest::Resume => Ok(CoreResponse::Resume(engine.resume()?.into())),
        CoreRequest::Status => Ok(CoreResponse::Status(engine.status().into())),
    }
}

fn index_for(engine: &SyncEngine, query: Option<String>) -> SearchIndex {
    let query = match query {
        Some(query) => {
            engine.set_query(&query);
            query
        }
        None => engine.registry().current_query(),
    };
    let mut index = SearchIndex::new();
    index.set_query(&query);
    index
}

fn map_engine_error(error: EngineError) -> ErrorResponse {
    let code = match &error {
        EngineError::Registry(RegistryError::UnknownIdentifier(_)) => ErrorCode::UnknownIdentifier,
        EngineError::Uninstall(_) => ErrorCode::Uninstall,
        EngineError::Stopped => ErrorCode::Stopped,
        EngineError::Spawn { .. } => ErrorCode::Internal,
    };
    ErrorResponse {
        code,
        message: error.to_string(),
    }
}
