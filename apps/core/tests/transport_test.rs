use std::sync::Arc;
use std::time::Duration;

use roster_core::contract::{CoreRequest, CoreResponse, IdentifierRequest};
use roster_core::engine::{EngineSettings, SyncEngine};
use roster_core::package_source::FixedPackageSource;
use roster_core::pin_store::MemoryPinStore;
use roster_core::transport::{handle_json, handle_request, ErrorCode, TransportResponse};

fn loaded_engine() -> SyncEngine {
    let engine = SyncEngine::new(
        Arc::new(FixedPackageSource::deterministic_fixture()),
        Arc::new(MemoryPinStore::default()),
        EngineSettings::default(),
    )
    .unwrap();
    let subscription = engine.observe();
    engine.start().unwrap();
    subscription
        .wait_for(Duration::from_secs(3), |snapshot| snapshot.is_initialized())
        .unwrap();
    engine
}

fn call(engine: &SyncEngine, raw: &str) -> TransportResponse {
    serde_json::from_str(&handle_json(engine, raw)).unwrap()
}

fn error_code(response: TransportResponse) -> ErrorCode {
    match response {
        TransportResponse::Err { error } => error.code,
        other => panic!("expected error response, got {other:?}"),
    }
}

#[test]
fn list_filters_case_insensitively_and_remembers_query() {
    let engine = loaded_engine();

    match call(&engine, r#"{"kind":"List","payload":{"query":"MAPS"}}"#) {
        TransportResponse::Ok {
            response: CoreResponse::List(list),
        } => {
            assert_eq!(list.query, "MAPS");
            assert_eq!(list.records.len(), 1);
            assert_eq!(list.records[0].identifier, "org.gnome.Maps");
        }
        other => panic!("expected list response, got {other:?}"),
    }

    match call(&engine, r#"{"kind":"List","payload":{}}"#) {
        TransportResponse::Ok {
            response: CoreResponse::List(list),
        } => assert_eq!(list.query, "MAPS"),
        other => panic!("expected list response, got {other:?}"),
    }
}

#[test]
fn empty_query_lists_all_in_order() {
    let engine = loaded_engine();
    match call(&engine, r#"{"kind":"List","payload":{"query":""}}"#) {
        TransportResponse::Ok {
            response: CoreResponse::List(list),
        } => {
            let names: Vec<&str> = list
                .records
                .iter()
                .map(|record| record.display_name.as_str())
                .collect();
            assert_eq!(names, vec!["calculator", "Firefox", "Maps"]);
        }
        other => panic!("expected list response, got {other:?}"),
    }
}

#[test]
fn toggle_pin_reports_persisted_state() {
    let engine = loaded_engine();
    let response = handle_request(
        &engine,
        CoreRequest::TogglePin(IdentifierRequest {
            identifier: "org.mozilla.firefox".into(),
        }),
    );
    match response {
        TransportResponse::Ok {
            response: CoreResponse::TogglePin(pin),
        } => {
            assert!(pin.pinned);
            assert!(pin.persisted);
            assert!(pin.warning.is_none());
        }
        other => panic!("expected pin response, got {other:?}"),
    }
}

#[test]
fn json_handler_returns_invalid_json_error_code() {
    let engine = loaded_engine();
    assert_eq!(error_code(call(&engine, "{not-json")), ErrorCode::InvalidJson);
}

#[test]
fn unknown_identifier_and_missing_uninstaller_map_to_codes() {
    let engine = loaded_engine();
    assert_eq!(
        error_code(call(
            &engine,
            r#"{"kind":"TogglePin","payload":{"identifier":"nope"}}"#
        )),
        ErrorCode::UnknownIdentifier
    );
    assert_eq!(
        error_code(call(
            &engine,
            r#"{"kind":"Uninstall","payload":{"identifier":"org.gnome.Maps"}}"#
        )),
        ErrorCode::Uninstall
    );
}

#[test]
fn status_and_lifecycle_requests_succeed() {
    let engine = loaded_engine();
    assert!(matches!(
        call(&engine, r#"{"kind":"Pause"}"#),
        TransportResponse::Ok {
            response: CoreResponse::Accepted
        }
    ));
    match call(&engine, r#"{"kind":"Status"}"#) {
        TransportResponse::Ok {
            response: CoreResponse::Status(status),
        } => {
            assert!(status.initialized);
            assert!(status.paused);
            assert_eq!(status.records, 3);
            assert_eq!(status.full_loads, 1);
        }
        other => panic!("expected status response, got {other:?}"),
    }
    match call(&engine, r#"{"kind":"Resume"}"#) {
        TransportResponse::Ok {
            response: CoreResponse::Resume(resume),
        } => assert_eq!(resume.resolution, "settled"),
        other => panic!("expected resume response, got {other:?}"),
    }

    engine.shutdown();
    assert_eq!(error_code(call(&engine, r#"{"kind":"Reload"}"#)), ErrorCode::Stopped);
}

#[test]
fn groups_request_returns_letter_buckets() {
    let engine = loaded_engine();
    match call(&engine, r#"{"kind":"Groups","payload":{}}"#) {
        TransportResponse::Ok {
            response: CoreResponse::Groups(groups),
        } => {
            let letters: Vec<&str> = groups.groups.iter().map(|g| g.letter.as_str()).collect();
            assert_eq!(letters, vec!["C", "F", "M"]);
        }
        other => panic!("expected groups response, got {other:?}"),
    }
}
