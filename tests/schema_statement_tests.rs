//! Statement-surface coverage: declarative-schema verbs, pragmas, ANALYZE,
//! EXPLAIN, and the vtab change-event stream.

use quereus::vtab::DmlOp;
use quereus::{Database, QuereusError, SqlValue};

fn texts(rows: &[Vec<SqlValue>]) -> Vec<String> {
    rows.iter().map(|r| r[0].to_string()).collect()
}

#[tokio::test]
async fn test_declare_diff_apply_roundtrip() {
    let db = Database::new();
    let session = db.session();

    session
        .execute(
            "DECLARE SCHEMA \
             CREATE TABLE users(id INTEGER PRIMARY KEY, name TEXT NOT NULL); \
             CREATE UNIQUE INDEX users_name ON users(name); \
             INSERT INTO users VALUES (1, 'seed')",
        )
        .await
        .unwrap();

    // Nothing exists yet, so the diff creates everything declared.
    let diff = session.query("DIFF SCHEMA").await.unwrap();
    let lines = texts(&diff.rows);
    assert!(lines.iter().any(|l| l.contains("CREATE TABLE users")));
    assert!(lines.iter().any(|l| l.contains("CREATE UNIQUE INDEX users_name")));

    session.execute("APPLY SCHEMA WITH SEED").await.unwrap();

    let result = session.query("SELECT name FROM users").await.unwrap();
    assert_eq!(texts(&result.rows), vec!["seed"]);

    // Applying again is a no-op: the diff is empty.
    let diff = session.query("DIFF SCHEMA").await.unwrap();
    assert!(diff.rows.is_empty(), "unexpected diff: {:?}", texts(&diff.rows));
}

#[tokio::test]
async fn test_diff_drops_undeclared_tables() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE legacy(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    session
        .execute("DECLARE SCHEMA CREATE TABLE fresh(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();

    let diff = session.query("DIFF SCHEMA").await.unwrap();
    let lines = texts(&diff.rows);
    assert!(lines.iter().any(|l| l.contains("DROP TABLE legacy")));
    assert!(lines.iter().any(|l| l.contains("CREATE TABLE fresh")));

    session.execute("APPLY SCHEMA").await.unwrap();
    assert!(session.query("SELECT * FROM legacy").await.is_err());
    let result = session.query("SELECT count(*) FROM fresh").await.unwrap();
    assert_eq!(result.scalar().map(ToString::to_string).as_deref(), Some("0"));
}

#[tokio::test]
async fn test_explain_schema_renders_declaration() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("DECLARE SCHEMA CREATE TABLE t(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    let result = session.query("EXPLAIN SCHEMA").await.unwrap();
    assert_eq!(result.column_names(), vec!["sql"]);
    assert!(texts(&result.rows)[0].contains("CREATE TABLE"));
}

#[tokio::test]
async fn test_diff_without_declaration_is_misuse() {
    let db = Database::new();
    let session = db.session();
    let err = session.query("DIFF SCHEMA").await.unwrap_err();
    assert!(matches!(err, QuereusError::Misuse(_)));
}

#[tokio::test]
async fn test_explain_statement_renders_plan_tree() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
        .await
        .unwrap();
    let result = session
        .query("EXPLAIN SELECT v FROM t WHERE id = 1")
        .await
        .unwrap();
    let lines = texts(&result.rows);
    assert!(lines.iter().any(|l| l.contains("TableScan")));
    assert!(
        lines.iter().any(|l| l.contains("point lookup")),
        "expected the chosen access path in {lines:?}"
    );
}

#[tokio::test]
async fn test_pragma_settings_roundtrip() {
    let db = Database::new();
    let session = db.session();

    let result = session
        .query("PRAGMA recursive_cte_limit = 7")
        .await
        .unwrap();
    assert_eq!(result.scalar().map(ToString::to_string).as_deref(), Some("7"));
    let result = session.query("PRAGMA recursive_cte_limit").await.unwrap();
    assert_eq!(result.scalar().map(ToString::to_string).as_deref(), Some("7"));

    let result = session.query("PRAGMA cache_threshold = 100").await.unwrap();
    assert_eq!(
        result.scalar().map(ToString::to_string).as_deref(),
        Some("100")
    );

    let result = session.query("PRAGMA module_list").await.unwrap();
    assert_eq!(texts(&result.rows), vec!["memory", "series"]);
}

#[tokio::test]
async fn test_pragma_table_info() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE info(id INTEGER PRIMARY KEY, v TEXT NOT NULL)")
        .await
        .unwrap();
    let result = session.query("PRAGMA table_info('info')").await.unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0][1].to_string(), "id");
    assert_eq!(result.rows[0][5].to_string(), "1", "id is pk part 1");
    assert_eq!(result.rows[1][1].to_string(), "v");
    assert_eq!(result.rows[1][3].to_string(), "1", "v is NOT NULL");
}

#[tokio::test]
async fn test_schema_version_bumps_with_ddl() {
    let db = Database::new();
    let session = db.session();
    let before = session.query("PRAGMA schema_version").await.unwrap();
    session
        .execute("CREATE TABLE v1(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    let after = session.query("PRAGMA schema_version").await.unwrap();
    let (Some(SqlValue::Integer(a)), Some(SqlValue::Integer(b))) =
        (before.scalar(), after.scalar())
    else {
        panic!("schema_version should be an integer");
    };
    assert!(b > a);
}

#[tokio::test]
async fn test_analyze_feeds_planner_statistics() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE s(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    session
        .execute("INSERT INTO s VALUES (1),(2),(3)")
        .await
        .unwrap();
    session.execute("ANALYZE s").await.unwrap();
    let stats = db.catalog().get_stats("s").unwrap();
    assert_eq!(stats.row_count, 3);
}

#[tokio::test]
async fn test_change_events_published_per_mutation() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE e(id INTEGER PRIMARY KEY, v TEXT)")
        .await
        .unwrap();

    let table = db.table("e").await.unwrap();
    let mut events = table.subscribe_changes().unwrap();

    session
        .execute("INSERT INTO e VALUES (1,'a')")
        .await
        .unwrap();
    session
        .execute("DELETE FROM e WHERE id = 1")
        .await
        .unwrap();

    let first = events.recv().await.unwrap();
    assert_eq!(first.op, DmlOp::Insert);
    assert_eq!(first.table, "e");
    assert_eq!(first.key.len(), 1);
    assert_eq!(first.key[0].to_string(), "1");
    let second = events.recv().await.unwrap();
    assert_eq!(second.op, DmlOp::Delete);
}

#[tokio::test]
async fn test_tracer_observes_instructions() {
    use quereus::CollectingTracer;
    use std::sync::Arc;

    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE tr(id INTEGER PRIMARY KEY); INSERT INTO tr VALUES (1)")
        .await
        .unwrap();

    let tracer = Arc::new(CollectingTracer::default());
    session.set_tracer(Some(tracer.clone() as Arc<dyn quereus::Tracer>));
    session.query("SELECT id FROM tr WHERE id = 1").await.unwrap();
    session.set_tracer(None);

    let events = tracer.events.lock();
    assert!(
        events.iter().any(|e| e.contains("scan tr")),
        "tracer events were {events:?}"
    );
}

#[tokio::test]
async fn test_drop_table_destroys_backing_storage() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE gone(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    session.execute("DROP TABLE gone").await.unwrap();
    assert!(session.query("SELECT * FROM gone").await.is_err());

    // Recreating after a drop works from a clean slate.
    session
        .execute("CREATE TABLE gone(id INTEGER PRIMARY KEY); INSERT INTO gone VALUES (1)")
        .await
        .unwrap();
    let result = session.query("SELECT count(*) FROM gone").await.unwrap();
    assert_eq!(result.scalar().map(ToString::to_string).as_deref(), Some("1"));
}
