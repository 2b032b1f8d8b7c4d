//! A sync written to a JSON Lines file, as the `sync` command does.

use std::sync::Arc;

use checkpoint::{SyncConfig, SyncManager};
use rdb_sync::JsonlSink;
use rdb_sync_mssql_source::testing::FakeDatabase;
use rdb_sync_mssql_source::{run_sync, PersistingSink, SyncContext, SyncOpts};
use serde_json::{json, Value as JsonValue};
use sync_core::{Catalog, Value};
use tempfile::TempDir;

const CATALOG: &str = r#"
streams:
  - namespace: dbo
    name: orders
    sync_mode: incremental
    cursor: version
    fields:
      - name: id
        type: integer
      - name: version
        type: integer
"#;

fn database() -> FakeDatabase {
    let db = FakeDatabase::new();
    db.rows(
        "INFORMATION_SCHEMA.TABLES",
        vec![vec![Value::String("BASE TABLE".into())]],
    );
    db.rows("is_primary_key = 1", vec![vec![Value::String("id".into())]]);
    db.rows("i.type = 1", vec![]);
    db.rows(
        "FROM [dbo].[orders]",
        (1..=3)
            .map(|i| vec![Value::Integer(i), Value::Integer(i * 10)])
            .collect(),
    );
    db.rows("MAX([version])", vec![vec![Value::Integer(30)]]);
    db
}

#[tokio::test]
async fn test_sync_writes_records_before_their_state() {
    let dir = TempDir::new().unwrap();
    let output_path = dir.path().join("out.jsonl");
    let manager = SyncManager::new(
        SyncConfig::with_checkpoint_dir(dir.path().join("state").to_string_lossy().into_owned()),
        "mssql",
    );
    let catalog = Catalog::from_yaml(CATALOG).unwrap();

    let file = tokio::fs::File::create(&output_path).await.unwrap();
    let output = Arc::new(JsonlSink::new(file));
    let sink = Arc::new(PersistingSink::new(output.clone(), manager.clone()));
    let ctx = SyncContext::new(Arc::new(database()), sink, SyncOpts::default());

    let report = run_sync(&ctx, &catalog, &manager).await.unwrap();
    output.flush().await.unwrap();
    assert_eq!(report.records, 3);

    let lines: Vec<JsonValue> = std::fs::read_to_string(&output_path)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let kinds: Vec<&str> = lines.iter().map(|l| l["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["RECORD", "RECORD", "RECORD", "STATE"]);

    let state = &lines[3]["state"]["stream"];
    assert_eq!(state["stream_descriptor"]["name"], "orders");
    assert_eq!(state["stream_state"]["cursor_field"], json!(["version"]));
    assert_eq!(state["stream_state"]["cursor"], json!(30));

    // The same state was persisted for the next run
    let stored = manager.read_stream_state("dbo.orders").await.unwrap().unwrap();
    assert_eq!(stored.as_json(), &state["stream_state"]);
}
