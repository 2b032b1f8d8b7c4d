//! Unit tests for the checkpoint crate.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

use crate::{
    Checkpoint, CheckpointFile, CheckpointID, CheckpointStore, CursorBasedState, FilesystemStore,
    OpaqueStateValue, PrimaryKeyState, StreamStateValue, SyncConfig, SyncManager, SyncPhase,
    CHECKPOINT_FILE_VERSION,
};

/// Test checkpoint type for unit tests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct TestCheckpoint {
    value: i64,
    timestamp: DateTime<Utc>,
}

impl Checkpoint for TestCheckpoint {
    const DATABASE_TYPE: &'static str = "test";

    fn to_cli_string(&self) -> String {
        format!("{}:{}", self.value, self.timestamp.to_rfc3339())
    }

    fn from_cli_string(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.splitn(2, ':').collect();
        if parts.len() != 2 {
            anyhow::bail!("Invalid test checkpoint format: expected 'value:timestamp'");
        }
        Ok(Self {
            value: parts[0].parse()?,
            timestamp: DateTime::parse_from_rfc3339(parts[1])?.with_timezone(&Utc),
        })
    }
}

fn migrate(raw: serde_json::Value) -> serde_json::Value {
    StreamStateValue::parse(&raw).to_opaque().into_json()
}

/// Migration applied to its own output must be a no-op.
fn assert_idempotent(raw: serde_json::Value) {
    let once = migrate(raw);
    let twice = migrate(once.clone());
    assert_eq!(once, twice);
}

// ============================================================================
// State migration Tests
// ============================================================================

#[test]
fn test_ordered_column_migrates_to_primary_key() {
    let migrated = migrate(json!({
        "version": 2,
        "state_type": "ordered_column",
        "ordered_col": "id",
        "ordered_col_val": "12345"
    }));

    assert_eq!(
        migrated,
        json!({"state_type": "primary_key", "pk_name": "id", "pk_value": 12345, "version": 3})
    );
}

#[test]
fn test_ordered_column_keeps_non_integer_strings() {
    let migrated = migrate(json!({
        "state_type": "ordered_column",
        "ordered_col": "code",
        "ordered_col_val": "00123"
    }));
    assert_eq!(migrated["pk_value"], json!("00123"));

    let migrated = migrate(json!({
        "state_type": "ordered_column",
        "ordered_col": "name",
        "ordered_col_val": "abc"
    }));
    assert_eq!(migrated["pk_value"], json!("abc"));
}

#[test]
fn test_ordered_column_with_nested_cursor_state() {
    let migrated = migrate(json!({
        "state_type": "ordered_column",
        "ordered_col": "id",
        "ordered_col_val": "7",
        "incremental_state": {
            "cursor_field": ["updated_at"],
            "cursor": "2024-01-01T00:00:00.000000",
            "cursor_record_count": 2
        }
    }));

    assert_eq!(migrated["pk_value"], json!(7));
    assert_eq!(
        migrated["incremental_state"],
        json!({
            "state_type": "cursor_based",
            "version": 3,
            "cursor_field": ["updated_at"],
            "cursor": "2024-01-01T00:00:00.000000",
            "cursor_record_count": 2
        })
    );
}

#[test]
fn test_null_incremental_state_is_preserved() {
    let migrated = migrate(json!({
        "state_type": "primary_key",
        "pk_name": "id",
        "pk_value": 10,
        "incremental_state": null
    }));
    assert_eq!(migrated["incremental_state"], serde_json::Value::Null);
    assert!(migrated.as_object().unwrap().contains_key("incremental_state"));

    let migrated = migrate(json!({
        "state_type": "ordered_column",
        "ordered_col": "id",
        "ordered_col_val": "10",
        "incremental_state": {}
    }));
    assert_eq!(migrated["incremental_state"], json!({}));
}

#[test]
fn test_pk_val_alias_is_accepted() {
    let state = StreamStateValue::parse(&json!({
        "state_type": "primary_key",
        "pk_name": "id",
        "pk_val": 99
    }));
    let StreamStateValue::PrimaryKey(pk) = state else {
        panic!("expected primary key state");
    };
    assert_eq!(pk.pk_names, vec!["id".to_string()]);
    assert_eq!(pk.pk_values, vec![json!(99)]);
    assert_eq!(pk.incremental_state, None);
}

#[test]
fn test_cursor_based_with_pk_name_is_primary_key() {
    let state = StreamStateValue::parse(&json!({
        "state_type": "cursor_based",
        "pk_name": "id",
        "pk_value": "abc"
    }));
    assert!(matches!(state, StreamStateValue::PrimaryKey(_)));
}

#[test]
fn test_undiscriminated_cursor_state() {
    let migrated = migrate(json!({
        "cursor_field": ["updated_at"],
        "cursor": "2024-05-01T10:00:00.000000",
        "cursor_record_count": 1,
        "stream_name": "orders",
        "stream_namespace": "dbo"
    }));

    assert_eq!(
        migrated,
        json!({
            "state_type": "cursor_based",
            "version": 3,
            "cursor_field": ["updated_at"],
            "cursor": "2024-05-01T10:00:00.000000",
            "cursor_record_count": 1,
            "stream_name": "orders",
            "stream_namespace": "dbo"
        })
    );
}

#[test]
fn test_unrecognized_shapes_default_to_start_of_stream() {
    for raw in [
        json!(null),
        json!(42),
        json!("text"),
        json!({}),
        json!({"state_type": "something_else"}),
        json!({"state_type": "primary_key"}),
        json!({"state_type": "primary_key", "pk_name": ["a", "b"], "pk_value": [1]}),
    ] {
        let state = StreamStateValue::parse(&raw);
        assert_eq!(state, StreamStateValue::default(), "input: {raw}");
        assert!(state.is_start_of_stream());
    }
}

#[test]
fn test_migration_is_idempotent() {
    assert_idempotent(json!({
        "version": 2,
        "state_type": "ordered_column",
        "ordered_col": "id",
        "ordered_col_val": "12345",
        "incremental_state": null
    }));
    assert_idempotent(json!({
        "state_type": "ordered_column",
        "ordered_col": "id",
        "ordered_col_val": "1",
        "incremental_state": {"cursor_field": ["ts"], "cursor": null}
    }));
    assert_idempotent(json!({"cursor_field": ["ts"], "cursor": "x"}));
    assert_idempotent(json!({
        "state_type": "primary_key",
        "pk_name": ["tenant", "id"],
        "pk_value": ["acme", 3]
    }));
    assert_idempotent(json!("garbage"));
}

#[test]
fn test_composite_key_round_trip() {
    let state = StreamStateValue::PrimaryKey(PrimaryKeyState::new(
        vec!["tenant".into(), "id".into()],
        vec![json!("acme"), json!(3)],
    ));
    let opaque = state.to_opaque();

    assert_eq!(opaque.as_json()["pk_name"], json!(["tenant", "id"]));
    assert_eq!(opaque.as_json()["pk_value"], json!(["acme", 3]));
    assert_eq!(opaque.migrate(), state);
}

#[test]
fn test_completed_snapshot_sentinel() {
    let sentinel = CursorBasedState::completed_snapshot("users", Some("dbo"));
    let opaque = StreamStateValue::CursorBased(sentinel).to_opaque();

    assert_eq!(opaque.as_json()["cursor_field"], json!([]));
    assert_eq!(opaque.as_json()["cursor"], serde_json::Value::Null);
    let StreamStateValue::CursorBased(migrated) = opaque.migrate() else {
        panic!("sentinel must stay cursor based");
    };
    assert!(migrated.is_completed_snapshot_of("users", Some("dbo")));
    assert!(!migrated.is_completed_snapshot_of("users", None));
    assert!(!migrated.is_completed_snapshot_of("orders", Some("dbo")));
    assert!(!opaque.migrate().is_start_of_stream());

    let in_progress = CursorBasedState::new("updated_at", json!("2024-01-01"), 1);
    assert!(!in_progress.is_empty());
    assert_eq!(in_progress.cursor_name(), Some("updated_at"));
}

#[test]
fn test_large_decimal_cursor_keeps_exact_text() {
    let raw: serde_json::Value =
        serde_json::from_str(r#"{"cursor_field":["amount"],"cursor":1234567890123456789.12345678}"#)
            .unwrap();
    let migrated = migrate(raw);
    assert_eq!(
        serde_json::to_string(&migrated["cursor"]).unwrap(),
        "1234567890123456789.12345678"
    );
}

// ============================================================================
// CheckpointFile Tests
// ============================================================================

#[test]
fn test_checkpoint_file_roundtrip() {
    let original = TestCheckpoint {
        value: 12345,
        timestamp: Utc::now(),
    };

    let file = CheckpointFile::new(&original, SyncPhase::CdcStreaming).unwrap();
    let json = serde_json::to_string_pretty(&file).unwrap();
    let loaded: CheckpointFile = serde_json::from_str(&json).unwrap();
    let parsed: TestCheckpoint = loaded.parse().unwrap();

    assert_eq!(loaded.phase(), &SyncPhase::CdcStreaming);
    assert_eq!(original.value, parsed.value);
    assert_eq!(original.timestamp.timestamp(), parsed.timestamp.timestamp());
}

#[test]
fn test_checkpoint_file_type_mismatch() {
    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct OtherCheckpoint {
        value: i64,
    }

    impl Checkpoint for OtherCheckpoint {
        const DATABASE_TYPE: &'static str = "other";

        fn to_cli_string(&self) -> String {
            self.value.to_string()
        }

        fn from_cli_string(s: &str) -> anyhow::Result<Self> {
            Ok(Self { value: s.parse()? })
        }
    }

    let cp = TestCheckpoint {
        value: 1,
        timestamp: Utc::now(),
    };
    let file = CheckpointFile::new(&cp, SyncPhase::CdcStreaming).unwrap();

    let err = file.parse::<OtherCheckpoint>().unwrap_err();
    assert!(err.to_string().contains("Checkpoint type mismatch"));
}

#[test]
fn test_checkpoint_file_without_version_loads() {
    let raw = json!({
        "database_type": "test",
        "checkpoint": { "value": 9, "timestamp": "2024-01-01T00:00:00Z" },
        "phase": "CdcStreaming",
        "created_at": "2024-01-01T00:00:00Z"
    });
    let file: CheckpointFile = serde_json::from_value(raw).unwrap();
    assert_eq!(file.version, 0);
    let parsed: TestCheckpoint = file.parse().unwrap();
    assert_eq!(parsed.value, 9);
}

#[test]
fn test_checkpoint_file_from_newer_layout_is_refused() {
    let cp = TestCheckpoint {
        value: 1,
        timestamp: Utc::now(),
    };
    let mut file = CheckpointFile::new(&cp, SyncPhase::CdcStreaming).unwrap();
    file.version = CHECKPOINT_FILE_VERSION + 1;

    let err = file.parse::<TestCheckpoint>().unwrap_err();
    assert!(err.to_string().contains("newer than the supported"));
}

#[test]
fn test_sync_phase_parse() {
    for phase in [
        SyncPhase::Snapshot,
        SyncPhase::CursorIncremental,
        SyncPhase::CdcStreaming,
    ] {
        assert_eq!(SyncPhase::parse(phase.as_str()).unwrap(), phase);
    }
    assert!(SyncPhase::parse("full_sync_start").is_err());
}

// ============================================================================
// Store and SyncManager Tests
// ============================================================================

#[tokio::test]
async fn test_filesystem_store_keeps_latest_only() {
    let tmp = TempDir::new().unwrap();
    let store = FilesystemStore::new(tmp.path());
    let id = CheckpointID::new("mssql", "stream.dbo.users");

    store
        .store_checkpoint(&id, SyncPhase::Snapshot, "first".into())
        .await
        .unwrap();
    store
        .store_checkpoint(&id, SyncPhase::CursorIncremental, "second".into())
        .await
        .unwrap();

    let stored = store.read_checkpoint(&id).await.unwrap().unwrap();
    assert_eq!(stored.checkpoint_data, "second");
    assert_eq!(stored.phase, SyncPhase::CursorIncremental);

    let files: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
    assert_eq!(files.len(), 1);

    let missing = CheckpointID::new("mssql", "stream.dbo.other");
    assert!(store.read_checkpoint(&missing).await.unwrap().is_none());
}

#[tokio::test]
async fn test_manager_stream_state_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let config = SyncConfig::with_checkpoint_dir(tmp.path().to_string_lossy().to_string());
    let manager = SyncManager::new(config, "mssql");

    assert!(manager.read_stream_state("dbo.users").await.unwrap().is_none());

    let state = StreamStateValue::PrimaryKey(PrimaryKeyState::new(
        vec!["id".into()],
        vec![json!(500)],
    ))
    .to_opaque();
    manager
        .emit_stream_state("dbo.users", SyncPhase::Snapshot, &state)
        .await
        .unwrap();

    let restored = manager.read_stream_state("dbo.users").await.unwrap();
    assert_eq!(restored, Some(state));
}

#[tokio::test]
async fn test_manager_global_checkpoint_roundtrip() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FilesystemStore::new(tmp.path()));
    let manager = SyncManager::with_store(
        SyncConfig::with_checkpoint_dir(tmp.path().to_string_lossy().to_string()),
        "mssql",
        store,
    );

    assert!(manager
        .read_checkpoint::<TestCheckpoint>()
        .await
        .unwrap()
        .is_none());

    let cp = TestCheckpoint {
        value: 77,
        timestamp: Utc::now(),
    };
    manager
        .emit_checkpoint(&cp, SyncPhase::CdcStreaming)
        .await
        .unwrap();

    let loaded = manager.read_checkpoint::<TestCheckpoint>().await.unwrap();
    assert_eq!(loaded.map(|c| c.value), Some(77));
}

#[tokio::test]
async fn test_disabled_manager_persists_nothing() {
    let manager = SyncManager::new(SyncConfig::disabled(), "mssql");
    let state = OpaqueStateValue::new(json!({"cursor_field": [], "cursor": null}));

    manager
        .emit_stream_state("dbo.users", SyncPhase::Snapshot, &state)
        .await
        .unwrap();
    assert!(manager.read_stream_state("dbo.users").await.unwrap().is_none());
}
