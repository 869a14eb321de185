use std::fs;
use std::sync::Arc;
use std::time::Duration;

use odf::failures::{write_fail_file, ERROR_REASON_COLUMN};
use odf::remote::WriteRule;
use odf::sink::CsvSink;
use odf::source::{self, ColumnTransform};
use odf::{
    export_records, import_records, ExportOptions, FieldDescriptor, ImportOptions, MemoryStore,
    MetadataCache, RelationKind, SessionManager,
};
use serde_json::json;
use tempfile::TempDir;

const PARTNER: &str = "res.partner";

fn partner_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    store.define_model(
        PARTNER,
        vec![
            FieldDescriptor::scalar("name", "char"),
            FieldDescriptor::scalar("city", "char"),
            FieldDescriptor::relation("parent_id", RelationKind::ManyToOne, PARTNER),
        ],
    );
    store.add_rule(PARTNER, WriteRule::Required("name".into()));
    Arc::new(store)
}

fn import_file(
    store: &Arc<MemoryStore>,
    path: &std::path::Path,
    options: &ImportOptions,
) -> odf::TransferReport {
    let table = source::read_csv(path, b',').unwrap();
    let records = source::transform_rows(&table.rows, &ColumnTransform::new()).unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime
        .block_on(import_records(store.clone(), records, PARTNER, options))
        .unwrap()
}

#[test]
fn invalid_row_is_isolated_and_reported() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("partners.csv");
    fs::write(
        &input,
        "id,name,city\np1,Acme,Lyon\np2,,Paris\np3,Globex,Nantes\n",
    )
    .unwrap();
    let store = partner_store();

    let report = import_file(&store, &input, &ImportOptions::default());
    assert_eq!(report.total_records, 3);
    assert_eq!(report.success_count, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].row, 1);
    assert!(report.failures[0].reason.contains("name"), "{}", report.failures[0].reason);
    assert_eq!(store.count(PARTNER), 2);
    assert!(store.id_for(PARTNER, "p2").is_none());

    let table = source::read_csv(&input, b',').unwrap();
    let fail_path = tmp.path().join("partners_fail.csv");
    let written = write_fail_file(&fail_path, &table.header, &table.rows, &report.failures, b',').unwrap();
    assert_eq!(written, 1);

    let fail_table = source::read_csv(&fail_path, b',').unwrap();
    assert_eq!(fail_table.header.last().map(String::as_str), Some(ERROR_REASON_COLUMN));
    assert_eq!(fail_table.rows.len(), 1);
    assert_eq!(fail_table.rows[0]["id"], json!("p2"));
    assert_eq!(fail_table.rows[0]["city"], json!("Paris"));
}

#[test]
fn rerunning_an_import_updates_in_place() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("partners.csv");
    fs::write(&input, "id,name,city\np1,Acme,Lyon\np2,Globex,Paris\n").unwrap();
    let store = partner_store();

    let first = import_file(&store, &input, &ImportOptions::default());
    assert!(first.is_complete_success());
    assert_eq!(store.count(PARTNER), 2);

    fs::write(&input, "id,name,city\np1,Acme,Marseille\np2,Globex,Paris\n").unwrap();
    let second = import_file(&store, &input, &ImportOptions::default());
    assert!(second.is_complete_success());
    assert_eq!(store.count(PARTNER), 2);
    let p1 = store.id_for(PARTNER, "p1").unwrap();
    assert_eq!(store.row(PARTNER, p1).unwrap()["city"], json!("Marseille"));
}

#[test]
fn failing_batch_does_not_sink_its_neighbours() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("partners.csv");
    let mut csv = String::from("id,name\n");
    for i in 0..20 {
        let name = if i == 7 { String::new() } else { format!("Partner {i}") };
        csv.push_str(&format!("p{i},{name}\n"));
    }
    fs::write(&input, csv).unwrap();
    let store = partner_store();

    let options = ImportOptions {
        batch_size: 5,
        workers: 3,
        ..ImportOptions::default()
    };
    let report = import_file(&store, &input, &options);
    assert_eq!(report.success_count, 19);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].row, 7);
    assert_eq!(store.count(PARTNER), 19);
}

#[test]
fn partitioned_rows_never_overlap() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("contacts.csv");
    let mut csv = String::from("id,name,city\n");
    for i in 0..24 {
        csv.push_str(&format!("c{i},Contact {i},City {}\n", i % 3));
    }
    fs::write(&input, csv).unwrap();
    let store = partner_store();
    store.track_partition_field("city");
    store.set_write_latency(Duration::from_millis(5));

    let options = ImportOptions {
        batch_size: 4,
        workers: 4,
        partition_key: Some("city".into()),
        ..ImportOptions::default()
    };
    let report = import_file(&store, &input, &options);
    assert!(report.is_complete_success(), "{:?}", report.failures);
    assert_eq!(store.count(PARTNER), 24);
    assert_eq!(store.stats().partition_overlaps, 0);
}

#[tokio::test]
async fn imported_rows_export_back_out() {
    let tmp = TempDir::new().unwrap();
    let store = partner_store();
    let records = source::transform_rows(
        &[
            json!({"id": "hq", "name": "Acme", "city": "Lyon", "parent_id/id": ""}),
            json!({"id": "branch", "name": "Acme Nord", "city": "Lille", "parent_id/id": "hq"}),
        ]
        .into_iter()
        .map(|row| row.as_object().cloned().unwrap())
        .collect::<Vec<_>>(),
        &ColumnTransform::new(),
    )
    .unwrap();
    let report = import_records(store.clone(), records, PARTNER, &ImportOptions::default())
        .await
        .unwrap();
    assert!(report.is_complete_success(), "{:?}", report.failures);

    let cache = Arc::new(MetadataCache::new(store.clone()));
    let sessions = SessionManager::new(tmp.path().join("sessions"));
    let run = export_records(
        cache,
        &sessions,
        PARTNER,
        &json!([]),
        &["name".to_string(), "parent_id".to_string(), "city".to_string()],
        ExportOptions::default(),
    )
    .await
    .unwrap();
    let output = tmp.path().join("out.csv");
    let mut sink = CsvSink::open(&output, b';', false).unwrap();
    let summary = run.drive(&mut sink).await.unwrap();
    drop(sink);

    assert!(summary.is_complete());
    assert_eq!(summary.exported, 2);
    assert!(sessions.list().unwrap().is_empty());
    assert_eq!(
        fs::read_to_string(&output).unwrap(),
        "name;parent_id;city\nAcme;;Lyon\nAcme Nord;Acme;Lille\n"
    );
}
