//! End-to-end pipeline tests
//!
//! Each test writes its sources into a temporary directory, runs the
//! coordinator against an in-memory sink and checks what reached the store.

use flate2::write::GzEncoder;
use graphload_ingest::progress::MemoryProgress;
use graphload_ingest::sink::RecordingSink;
use graphload_ingest::{
    Coordinator, IngestError, IngestPlan, RunContext, RunReport, RunState, SourceStatus, Stage,
};
use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    dir: TempDir,
    sink: Arc<RecordingSink>,
    progress: Arc<MemoryProgress>,
}

impl Harness {
    fn new() -> Self {
        Self::with_sink(RecordingSink::new())
    }

    fn with_sink(sink: RecordingSink) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            sink: Arc::new(sink),
            progress: Arc::new(MemoryProgress::new()),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, name: &str, content: &str) {
        std::fs::write(self.path().join(name), content).unwrap();
    }

    /// `rows` CSV lines of the form `i,name-i,i.50`
    fn write_rows(&self, name: &str, rows: usize) {
        let content: String = (1..=rows)
            .map(|i| format!("{},name-{},{}.50\n", i, i, i))
            .collect();
        self.write(name, &content);
    }

    /// Plan YAML with `basePath` set to the temporary directory
    fn plan(&self, body: &str) -> IngestPlan {
        let yaml = format!("basePath: {}\n{}", self.path().display(), body);
        IngestPlan::from_yaml_str(&yaml).unwrap()
    }

    async fn run(&self, plan: IngestPlan) -> RunReport {
        let context = RunContext::new(self.sink.clone()).with_progress(self.progress.clone());
        Coordinator::new(Arc::new(plan), context).run().await
    }

    fn batch_rows(&self) -> Vec<Vec<Value>> {
        self.sink
            .batch_calls()
            .into_iter()
            .map(|call| {
                call.rows
                    .unwrap()
                    .into_iter()
                    .map(Value::Object)
                    .collect()
            })
            .collect()
    }
}

fn source(location: &str, extra: &str) -> String {
    format!(
        "  - location: {}\n    label: Row\n    fields:\n      - {{ position: 0, propertyName: id }}\n      - {{ position: 1, propertyName: name }}\n{}",
        location, extra
    )
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_three_sources_one_batch_each() {
    let h = Harness::new();
    for name in ["a.csv", "b.csv", "c.csv"] {
        h.write_rows(name, 10);
    }
    let plan = h.plan(&format!(
        "sources:\n{}{}{}",
        source("a.csv", ""),
        source("b.csv", ""),
        source("c.csv", "")
    ));

    let report = h.run(plan).await;

    assert!(report.is_success());
    assert_eq!(report.rows_written(), 30);
    let batches = h.sink.batch_calls();
    assert_eq!(batches.len(), 3);
    assert!(batches.iter().all(|b| b.row_count() == 10));

    // one progress line per batch, each naming its source
    let lines = h.progress.lines();
    assert_eq!(lines.len(), 3);
    for (line, name) in lines.iter().zip(["a.csv", "b.csv", "c.csv"]) {
        assert_eq!(lines.iter().filter(|l| l.contains(name)).count(), 1);
        assert!(line.starts_with(name));
    }
}

#[tokio::test]
async fn test_skip_lines_starts_at_next_row() {
    let h = Harness::new();
    h.write_rows("people.csv", 10);
    let plan = h.plan(&format!("sources:\n{}", source("people.csv", "    skipLines: 3\n")));

    let report = h.run(plan).await;

    assert!(report.is_success());
    assert_eq!(report.sources[0].rows_written, 7);
    assert_eq!(report.sources[0].rows_skipped, 3);
    let rows = h.batch_rows();
    assert_eq!(rows[0].len(), 7);
    assert_eq!(rows[0][0], json!({ "id": "4", "name": "name-4" }));
    assert_eq!(rows[0][6], json!({ "id": "10", "name": "name-10" }));
}

#[tokio::test]
async fn test_skip_lines_beyond_source_writes_nothing() {
    let h = Harness::new();
    h.write_rows("short.csv", 2);
    let plan = h.plan(&format!("sources:\n{}", source("short.csv", "    skipLines: 5\n")));

    let report = h.run(plan).await;

    assert!(report.is_success());
    assert!(h.sink.batch_calls().is_empty());
    assert_eq!(report.sources[0].rows_skipped, 2);
}

#[tokio::test]
async fn test_chunk_size_splits_into_ceiling_batches() {
    let h = Harness::new();
    h.write_rows("ten.csv", 10);
    h.write_rows("eleven.csv", 11);
    let plan = h.plan(&format!(
        "sources:\n{}{}",
        source("ten.csv", "    chunkSize: 5\n"),
        source("eleven.csv", "    chunkSize: 5\n")
    ));

    let report = h.run(plan).await;

    assert!(report.is_success());
    assert_eq!(report.sources[0].batches, 2);
    assert_eq!(report.sources[1].batches, 3);
    let sizes: Vec<usize> = h.sink.batch_calls().iter().map(|c| c.row_count()).collect();
    assert_eq!(sizes, vec![5, 5, 5, 5, 1]);

    let indices: Vec<usize> = h.progress.batches().iter().map(|b| b.batch).collect();
    assert_eq!(indices, vec![0, 1, 0, 1, 2]);
}

#[tokio::test]
async fn test_skip_file_contributes_nothing() {
    let h = Harness::new();
    h.write_rows("kept.csv", 4);
    // an excluded source is never opened, so it may as well not exist
    let plan = h.plan(&format!(
        "sources:\n{}{}",
        source("missing.csv", "    skipFile: true\n"),
        source("kept.csv", "")
    ));

    let report = h.run(plan).await;

    assert!(report.is_success());
    assert!(matches!(report.sources[0].status, SourceStatus::SkippedByFlag));
    assert_eq!(report.sources[0].rows_written, 0);
    assert_eq!(h.sink.rows_written(), 4);
    assert!(h.progress.lines().iter().all(|l| !l.contains("missing.csv")));
}

#[tokio::test]
async fn test_scripts_run_once_around_batches() {
    let h = Harness::new();
    h.write_rows("a.csv", 3);
    h.write_rows("b.csv", 3);
    let plan = h.plan(&format!(
        "preIngestScripts:\n  - CREATE INDEX row_id IF NOT EXISTS FOR (n:Row) ON (n.id)\npostIngestScripts:\n  - MATCH (n:Row) SET n.loaded = true\nsources:\n{}{}",
        source("a.csv", "    chunkSize: 2\n"),
        source("b.csv", "")
    ));

    let report = h.run(plan).await;
    assert!(report.is_success());

    let calls = h.sink.calls();
    assert_eq!(calls.len(), 5);
    assert!(calls[0].statement.starts_with("CREATE INDEX"));
    assert!(!calls[0].is_batch());
    assert!(calls[1..4].iter().all(|c| c.is_batch()));
    assert!(calls[4].statement.starts_with("MATCH (n:Row)"));
    assert!(!calls[4].is_batch());
}

#[tokio::test]
async fn test_database_routes_every_call() {
    let h = Harness::new();
    h.write_rows("a.csv", 3);
    let plan = h.plan(&format!(
        "database: movies\npreIngestScripts: ['CREATE (:Pre)']\npostIngestScripts: ['CREATE (:Post)']\nsources:\n{}",
        source("a.csv", "")
    ));

    h.run(plan).await;

    let calls = h.sink.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.database.as_deref() == Some("movies")));
}

#[tokio::test]
async fn test_default_database_when_unset() {
    let h = Harness::new();
    h.write_rows("a.csv", 1);
    let plan = h.plan(&format!("sources:\n{}", source("a.csv", "")));

    h.run(plan).await;

    assert!(h.sink.calls().iter().all(|c| c.database.is_none()));
}

#[tokio::test]
async fn test_rejected_batch_fails_run_without_post_scripts() {
    let h = Harness::with_sink(RecordingSink::rejecting(":Broken"));
    h.write_rows("a.csv", 3);
    h.write_rows("b.csv", 3);
    h.write_rows("c.csv", 3);
    let plan = h.plan(&format!(
        "postIngestScripts: ['CREATE (:Post)']\nsources:\n{}  - location: b.csv\n    writeTemplate: 'UNWIND $rows AS row CREATE (n:Broken) SET n = row'\n    fields: [{{ position: 0, propertyName: id }}]\n{}",
        source("a.csv", ""),
        source("c.csv", "")
    ));

    let report = h.run(plan).await;

    assert_eq!(report.state, RunState::Failed);
    assert!(!report.is_success());
    assert!(matches!(
        report.first_error(),
        Some(IngestError::Write { index: 2, batch: 0, .. })
    ));
    assert!(matches!(report.sources[2].status, SourceStatus::NotStarted));
    // only the first source landed; c.csv and the post script never ran
    let calls = h.sink.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].row_count(), 3);
}

#[tokio::test]
async fn test_continue_on_source_error() {
    let h = Harness::new();
    h.write_rows("a.csv", 2);
    h.write_rows("c.csv", 2);
    let plan = h.plan(&format!(
        "continueOnSourceError: true\npostIngestScripts: ['CREATE (:Post)']\nsources:\n{}{}{}",
        source("a.csv", ""),
        source("gone.csv", ""),
        source("c.csv", "")
    ));

    let report = h.run(plan).await;

    assert_eq!(report.state, RunState::Done);
    assert!(!report.is_success());
    let failed: Vec<usize> = report.failed_sources().map(|s| s.index).collect();
    assert_eq!(failed, vec![2]);
    assert!(matches!(
        report.first_error(),
        Some(IngestError::SourceUnavailable { index: 2, stage: Stage::Resolve, .. })
    ));
    assert_eq!(h.sink.rows_written(), 4);
    let last = h.sink.calls().pop().unwrap();
    assert_eq!(last.statement, "CREATE (:Post)");
}

#[tokio::test]
async fn test_malformed_record_aborts_source() {
    let h = Harness::new();
    h.write("bad.csv", "1,ok\n2\n3,ok\n");
    let plan = h.plan(&format!("sources:\n{}", source("bad.csv", "    chunkSize: 1\n")));

    let report = h.run(plan).await;

    assert_eq!(report.state, RunState::Failed);
    match report.first_error() {
        Some(IngestError::RecordFormat { index, record, stage, .. }) => {
            assert_eq!(*index, 1);
            assert_eq!(*record, 2);
            assert_eq!(*stage, Stage::Map);
        },
        other => panic!("expected record format error, got {:?}", other),
    }
    assert_eq!(h.sink.batch_calls().len(), 1);
}

// ============================================================================
// Fidelity
// ============================================================================

#[tokio::test]
async fn test_numeric_text_is_preserved() {
    let h = Harness::new();
    h.write("n.csv", "123456789012345,5.23456,1.10,00042\n");
    let plan = h.plan(
        "sources:\n  - location: n.csv\n    label: N\n    fields:\n      - { position: 0, propertyName: big }\n      - { position: 1, propertyName: dec }\n      - { position: 2, propertyName: trailing }\n      - { position: 3, propertyName: padded }\n",
    );

    h.run(plan).await;

    let rows = h.batch_rows();
    assert_eq!(
        serde_json::to_string(&rows[0][0]).unwrap(),
        r#"{"big":"123456789012345","dec":"5.23456","trailing":"1.10","padded":"00042"}"#
    );
}

#[tokio::test]
async fn test_property_order_follows_configuration() {
    let h = Harness::new();
    h.write("cols.csv", "c0,c1,c2,c3\n");
    let plan = h.plan(
        "sources:\n  - location: cols.csv\n    label: C\n    fields:\n      - { position: 3, propertyName: p1 }\n      - { position: 1, propertyName: p2 }\n      - { position: 0, propertyName: p3 }\n",
    );

    h.run(plan).await;

    let rows = h.batch_rows();
    let object = rows[0][0].as_object().unwrap();
    let keys: Vec<&str> = object.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["p1", "p2", "p3"]);
    assert_eq!(object["p1"], "c3");
    assert_eq!(object["p2"], "c1");
    assert_eq!(object["p3"], "c0");
}

#[tokio::test]
async fn test_explicit_types() {
    let h = Harness::new();
    h.write("t.csv", "7,2.50,yes,\n");
    let plan = h.plan(
        "sources:\n  - location: t.csv\n    label: T\n    fields:\n      - { position: 0, propertyName: n, type: integer }\n      - { position: 1, propertyName: f, type: float }\n      - { position: 2, propertyName: b, type: boolean }\n      - { position: 3, propertyName: e, type: integer }\n",
    );

    h.run(plan).await;

    let rows = h.batch_rows();
    assert_eq!(
        serde_json::to_string(&rows[0][0]).unwrap(),
        r#"{"n":7,"f":2.50,"b":true,"e":null}"#
    );
}

// ============================================================================
// Formats and compression
// ============================================================================

#[tokio::test]
async fn test_json_array_source() {
    let h = Harness::new();
    h.write(
        "movies.json",
        r#"[{"title": "Alien", "year": 1979}, {"title": "Heat", "year": 1995.0}]"#,
    );
    let plan = h.plan(
        "sources:\n  - location: movies.json\n    label: Movie\n    fields:\n      - { position: 1, propertyName: year }\n      - { position: 0, propertyName: title }\n",
    );

    let report = h.run(plan).await;

    assert!(report.is_success());
    let rows = h.batch_rows();
    assert_eq!(rows[0][0], json!({ "year": "1979", "title": "Alien" }));
    assert_eq!(rows[0][1], json!({ "year": "1995.0", "title": "Heat" }));
}

#[tokio::test]
async fn test_json_objects_read_by_key() {
    let h = Harness::new();
    h.write(
        "people.json",
        r#"[{"id": 1, "name": "Ada"}, {"name": "Grace", "id": 2}, {"id": 3}]"#,
    );
    let plan = h.plan(
        "sources:\n  - location: people.json\n    label: Person\n    fields:\n      - { key: id, position: 0, propertyName: id, type: integer }\n      - { key: name, position: 1, propertyName: name }\n",
    );

    let report = h.run(plan).await;

    assert!(report.is_success());
    let rows = h.batch_rows();
    assert_eq!(rows[0][0], json!({ "id": 1, "name": "Ada" }));
    assert_eq!(rows[0][1], json!({ "id": 2, "name": "Grace" }));
    assert_eq!(rows[0][2], json!({ "id": 3, "name": null }));
}

#[tokio::test]
async fn test_json_objects_by_position_need_stable_key_order() {
    let h = Harness::new();
    h.write(
        "people.json",
        r#"[{"id": 1, "name": "Ada"}, {"name": "Grace", "id": 2}]"#,
    );
    let plan = h.plan(&format!("sources:\n{}", source("people.json", "    chunkSize: 1\n")));

    let report = h.run(plan).await;

    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(
        report.first_error(),
        Some(IngestError::RecordFormat { index: 1, record: 2, stage: Stage::Read, .. })
    ));
    // the first object is written, the reordered one never is
    assert_eq!(h.batch_rows(), vec![vec![json!({ "id": "1", "name": "Ada" })]]);
}

#[tokio::test]
async fn test_gzip_json_lines_source() {
    let h = Harness::new();
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    for i in 1..=4 {
        writeln!(encoder, "{{\"id\": {}, \"name\": \"n{}\"}}", i, i).unwrap();
    }
    std::fs::write(h.path().join("rows.jsonl.gz"), encoder.finish().unwrap()).unwrap();
    let plan = h.plan(&format!(
        "sources:\n{}",
        source("rows.jsonl.gz", "    chunkSize: 3\n    skipLines: 1\n")
    ));

    let report = h.run(plan).await;

    assert!(report.is_success());
    let rows = h.batch_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][0], json!({ "id": "2", "name": "n2" }));
}

#[tokio::test]
async fn test_zip_source_with_header_and_separator() {
    let h = Harness::new();
    let file = std::fs::File::create(h.path().join("export.zip")).unwrap();
    let mut archive = zip::ZipWriter::new(file);
    archive.start_file("readme.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    archive.write_all(b"not data").unwrap();
    archive.start_file("people.tsv", zip::write::SimpleFileOptions::default())
        .unwrap();
    archive.write_all(b"id\tname\n1\tAda\n2\tGrace\n").unwrap();
    archive.finish().unwrap();

    let plan = h.plan(&format!(
        "sources:\n{}",
        source(
            "export.zip",
            "    archiveEntry: people.tsv\n    header: true\n    fieldSeparator: \"\\t\"\n"
        )
    ));

    let report = h.run(plan).await;

    assert!(report.is_success());
    let rows = h.batch_rows();
    assert_eq!(
        rows[0],
        vec![
            json!({ "id": "1", "name": "Ada" }),
            json!({ "id": "2", "name": "Grace" })
        ]
    );
}

#[tokio::test]
async fn test_ambiguous_zip_is_configuration_error() {
    let h = Harness::new();
    let file = std::fs::File::create(h.path().join("bundle.zip")).unwrap();
    let mut archive = zip::ZipWriter::new(file);
    for name in ["a.csv", "b.csv"] {
        archive.start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        archive.write_all(b"1,x\n").unwrap();
    }
    archive.finish().unwrap();

    let plan = h.plan(&format!(
        "continueOnSourceError: true\nsources:\n{}",
        source("bundle.zip", "")
    ));

    let report = h.run(plan).await;

    assert_eq!(report.state, RunState::Failed);
    assert!(matches!(report.first_error(), Some(IngestError::Configuration(_))));
    assert!(h.sink.calls().is_empty());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_sources_keep_per_source_order() {
    let h = Harness::new();
    let names: Vec<String> = (0..6).map(|i| format!("s{}.csv", i)).collect();
    let mut body = String::from("parallelSources: 3\nsources:\n");
    for name in &names {
        h.write_rows(name, 9);
        body.push_str(&source(name, "    chunkSize: 2\n"));
    }

    let report = h.run(h.plan(&body)).await;

    assert!(report.is_success());
    assert_eq!(report.rows_written(), 54);
    let indices: Vec<usize> = report.sources.iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5, 6]);

    for name in &names {
        let order: Vec<usize> = h
            .progress
            .batches()
            .iter()
            .filter(|b| &b.location == name)
            .map(|b| b.batch)
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }
}
