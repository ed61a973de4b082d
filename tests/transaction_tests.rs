//! Transaction semantics over the layered MVCC overlay: snapshot
//! visibility, read-your-own-writes, savepoints, conflict policies, and
//! assertions.

use quereus::{Database, ExecOutcome, QuereusError, SqlValue};

async fn seeded() -> Database {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)")
        .await
        .unwrap();
    session
        .execute("INSERT INTO t VALUES (1,'a'),(2,'b')")
        .await
        .unwrap();
    db
}

async fn count(session: &quereus::Session) -> i64 {
    let result = session.query("SELECT count(*) FROM t").await.unwrap();
    match result.scalar() {
        Some(SqlValue::Integer(n)) => *n,
        other => panic!("expected integer count, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rollback_restores_pre_transaction_state() {
    let db = seeded().await;
    let session = db.session();

    session.execute("BEGIN DEFERRED").await.unwrap();
    session
        .execute("INSERT INTO t VALUES (3,'c')")
        .await
        .unwrap();
    assert_eq!(count(&session).await, 3, "writer sees its own insert");

    session.execute("ROLLBACK").await.unwrap();
    assert_eq!(count(&session).await, 2, "rollback discards the insert");
}

#[tokio::test]
async fn test_commit_publishes_atomically() {
    let db = seeded().await;
    let writer = db.session();
    let reader = db.session();

    writer.execute("BEGIN").await.unwrap();
    writer
        .execute("INSERT INTO t VALUES (3,'c'); INSERT INTO t VALUES (4,'d')")
        .await
        .unwrap();

    // A snapshot taken before the commit sees neither row.
    assert_eq!(count(&reader).await, 2);

    writer.execute("COMMIT").await.unwrap();

    // After the commit both rows appear together.
    assert_eq!(count(&reader).await, 4);
    assert_eq!(count(&writer).await, 4);
}

#[tokio::test]
async fn test_uncommitted_writes_are_private() {
    let db = seeded().await;
    let writer = db.session();
    let other = db.session();

    writer.execute("BEGIN").await.unwrap();
    writer
        .execute("UPDATE t SET v = 'changed' WHERE id = 1")
        .await
        .unwrap();

    let mine = writer
        .query("SELECT v FROM t WHERE id = 1")
        .await
        .unwrap();
    assert_eq!(mine.rows[0][0].to_string(), "changed");

    let theirs = other
        .query("SELECT v FROM t WHERE id = 1")
        .await
        .unwrap();
    assert_eq!(theirs.rows[0][0].to_string(), "a");

    writer.execute("COMMIT").await.unwrap();
    let theirs = other
        .query("SELECT v FROM t WHERE id = 1")
        .await
        .unwrap();
    assert_eq!(theirs.rows[0][0].to_string(), "changed");
}

#[tokio::test]
async fn test_savepoint_partial_rollback() {
    let db = seeded().await;
    let session = db.session();

    session.execute("SAVEPOINT s1").await.unwrap();
    session
        .execute("UPDATE t SET v='x' WHERE id=1")
        .await
        .unwrap();
    session.execute("SAVEPOINT s2").await.unwrap();
    session
        .execute("UPDATE t SET v='y' WHERE id=2")
        .await
        .unwrap();

    session.execute("ROLLBACK TO SAVEPOINT s1").await.unwrap();

    let result = session
        .query("SELECT v FROM t ORDER BY id")
        .await
        .unwrap();
    let values: Vec<String> = result.rows.iter().map(|r| r[0].to_string()).collect();
    assert_eq!(values, vec!["a", "b"]);
}

#[tokio::test]
async fn test_savepoint_rollback_is_repeatable() {
    let db = seeded().await;
    let session = db.session();

    session.execute("SAVEPOINT s").await.unwrap();
    session
        .execute("INSERT INTO t VALUES (3,'c')")
        .await
        .unwrap();
    session.execute("ROLLBACK TO SAVEPOINT s").await.unwrap();
    assert_eq!(count(&session).await, 2);

    // The savepoint survives; rolling back to it again is a no-op.
    session.execute("ROLLBACK TO SAVEPOINT s").await.unwrap();
    assert_eq!(count(&session).await, 2);

    session
        .execute("INSERT INTO t VALUES (3,'c')")
        .await
        .unwrap();
    session.execute("ROLLBACK TO SAVEPOINT s").await.unwrap();
    assert_eq!(count(&session).await, 2);
}

#[tokio::test]
async fn test_release_discards_later_savepoints() {
    let db = seeded().await;
    let session = db.session();

    session.execute("SAVEPOINT a").await.unwrap();
    session.execute("SAVEPOINT b").await.unwrap();
    session.execute("RELEASE a").await.unwrap();

    let err = session
        .execute("ROLLBACK TO SAVEPOINT b")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Misuse(_)));
}

#[tokio::test]
async fn test_release_without_mutation_is_noop() {
    let db = seeded().await;
    let session = db.session();
    session.execute("SAVEPOINT s").await.unwrap();
    session.execute("RELEASE s").await.unwrap();
    session.execute("COMMIT").await.unwrap();
    assert_eq!(count(&session).await, 2);
}

#[tokio::test]
async fn test_nested_begin_is_misuse() {
    let db = seeded().await;
    let session = db.session();
    session.execute("BEGIN").await.unwrap();
    let err = session.execute("BEGIN").await.unwrap_err();
    assert!(matches!(err, QuereusError::Misuse(_)));
    session.execute("ROLLBACK").await.unwrap();

    let err = session.execute("COMMIT").await.unwrap_err();
    assert!(matches!(err, QuereusError::Misuse(_)));
}

#[tokio::test]
async fn test_pk_conflict_aborts_statement_not_transaction() {
    let db = seeded().await;
    let session = db.session();

    session.execute("BEGIN").await.unwrap();
    session
        .execute("INSERT INTO t VALUES (3,'c')")
        .await
        .unwrap();
    // The duplicate aborts its own statement; the transaction and the
    // earlier insert survive.
    let err = session
        .execute("INSERT INTO t VALUES (1,'dup')")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
    assert_eq!(count(&session).await, 3);

    session.execute("COMMIT").await.unwrap();
    assert_eq!(count(&session).await, 3);
}

#[tokio::test]
async fn test_failed_statement_is_atomic() {
    let db = seeded().await;
    let session = db.session();

    session.execute("BEGIN").await.unwrap();
    // Multi-row insert where the second row conflicts: neither row lands.
    let err = session
        .execute("INSERT INTO t VALUES (3,'c'),(1,'dup')")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
    assert_eq!(count(&session).await, 2);
    session.execute("ROLLBACK").await.unwrap();
}

#[tokio::test]
async fn test_insert_or_ignore_and_replace() {
    let db = seeded().await;
    let session = db.session();

    let outcome = session
        .execute("INSERT OR IGNORE INTO t VALUES (1,'dup'),(3,'c')")
        .await
        .unwrap();
    assert!(matches!(outcome, ExecOutcome::Affected(1)));
    let result = session
        .query("SELECT v FROM t WHERE id = 1")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0].to_string(), "a");

    session
        .execute("INSERT OR REPLACE INTO t VALUES (1,'replaced')")
        .await
        .unwrap();
    let result = session
        .query("SELECT v FROM t WHERE id = 1")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0].to_string(), "replaced");
    assert_eq!(count(&session).await, 3);
}

#[tokio::test]
async fn test_insert_or_rollback_discards_transaction() {
    let db = seeded().await;
    let session = db.session();

    session.execute("BEGIN").await.unwrap();
    session
        .execute("INSERT INTO t VALUES (3,'c')")
        .await
        .unwrap();
    let err = session
        .execute("INSERT OR ROLLBACK INTO t VALUES (1,'dup')")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));

    // The whole transaction is gone, including the first insert.
    assert_eq!(count(&session).await, 2);
    // And no transaction remains active.
    let err = session.execute("COMMIT").await.unwrap_err();
    assert!(matches!(err, QuereusError::Misuse(_)));
}

#[tokio::test]
async fn test_not_null_and_check_constraints() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE c(id INTEGER PRIMARY KEY, n INTEGER NOT NULL CHECK (n > 0))",
        )
        .await
        .unwrap();

    let err = session
        .execute("INSERT INTO c VALUES (1, NULL)")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("NOT NULL"));

    let err = session
        .execute("INSERT INTO c VALUES (1, -5)")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("CHECK"));

    session.execute("INSERT INTO c VALUES (1, 5)").await.unwrap();
}

#[tokio::test]
async fn test_add_constraint_via_alter_table() {
    let db = seeded().await;
    let session = db.session();
    session
        .execute("ALTER TABLE t ADD CONSTRAINT short CHECK (length(v) < 5)")
        .await
        .unwrap();
    let err = session
        .execute("INSERT INTO t VALUES (3,'toolongvalue')")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
    session
        .execute("INSERT INTO t VALUES (3,'ok')")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_assertions_guard_mutations() {
    let db = seeded().await;
    let session = db.session();
    session
        .execute("CREATE ASSERTION capped CHECK ((SELECT count(*) FROM t) <= 3)")
        .await
        .unwrap();

    session
        .execute("INSERT INTO t VALUES (3,'c')")
        .await
        .unwrap();
    let err = session
        .execute("INSERT INTO t VALUES (4,'d')")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
    assert_eq!(count(&session).await, 3);

    session.execute("DROP ASSERTION capped").await.unwrap();
    session
        .execute("INSERT INTO t VALUES (4,'d')")
        .await
        .unwrap();
    assert_eq!(count(&session).await, 4);
}

#[tokio::test]
async fn test_unique_index_enforced() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE u(id INTEGER PRIMARY KEY, email TEXT); \
             CREATE UNIQUE INDEX u_email ON u(email); \
             INSERT INTO u VALUES (1,'a@example.com')",
        )
        .await
        .unwrap();
    let err = session
        .execute("INSERT INTO u VALUES (2,'a@example.com')")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Constraint(_)));
    session
        .execute("INSERT INTO u VALUES (2,'b@example.com')")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_scan_is_halloween_safe() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE h(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    session
        .execute("INSERT INTO h VALUES (1),(2),(3)")
        .await
        .unwrap();
    // Shifting every key up by one must touch each original row exactly
    // once, not chase its own writes.
    let outcome = session
        .execute("UPDATE h SET id = id + 10")
        .await
        .unwrap();
    assert!(matches!(outcome, ExecOutcome::Affected(3)));
    let result = session.query("SELECT id FROM h ORDER BY id").await.unwrap();
    let ids: Vec<String> = result.rows.iter().map(|r| r[0].to_string()).collect();
    assert_eq!(ids, vec!["11", "12", "13"]);
}

#[tokio::test]
async fn test_interrupt_cancels_statement() {
    let db = seeded().await;
    let session = db.session();
    session.interrupt();
    let err = session.query("SELECT v FROM t").await.unwrap_err();
    assert!(matches!(err, QuereusError::Cancelled));

    // The interrupt covers one statement; the session stays usable.
    assert_eq!(count(&session).await, 2);
}
