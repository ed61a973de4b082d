//! End-to-end SQL coverage: queries, joins, aggregation, set operations,
//! CTEs, window functions, views, parameters, and DML with RETURNING.

use std::collections::HashMap;

use quereus::{Database, ExecOutcome, ParamBindings, QuereusError, SqlValue};

async fn db_with_rows() -> Database {
    let _ = quereus::init_tracing();
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

fn texts(rows: &[Vec<SqlValue>]) -> Vec<String> {
    rows.iter().map(|r| r[0].to_string()).collect()
}

fn ints(rows: &[Vec<SqlValue>]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r[0] {
            SqlValue::Integer(i) => i,
            ref other => panic!("expected integer, got {other}"),
        })
        .collect()
}

#[tokio::test]
async fn test_order_by_desc() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session
        .query("SELECT v FROM t ORDER BY id DESC")
        .await
        .unwrap();
    assert_eq!(texts(&result.rows), vec!["b", "a"]);
    assert_eq!(result.column_names(), vec!["v"]);
}

#[tokio::test]
async fn test_order_by_pk_streams_without_sort() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session
        .query("SELECT v FROM t ORDER BY id")
        .await
        .unwrap();
    assert_eq!(texts(&result.rows), vec!["a", "b"]);
    // The scan provides primary-key order, so EXPLAIN shows no sort node.
    let plan = session
        .query("EXPLAIN SELECT v FROM t ORDER BY id")
        .await
        .unwrap();
    let rendered: Vec<String> = texts(&plan.rows);
    assert!(
        rendered.iter().all(|line| !line.contains("Sort")),
        "unexpected sort in {rendered:?}"
    );
}

#[tokio::test]
async fn test_where_with_parameters() {
    let db = db_with_rows().await;
    let session = db.session();

    let result = session
        .query_with(
            "SELECT v FROM t WHERE id = ?",
            ParamBindings::positional(vec![SqlValue::Integer(2)]),
        )
        .await
        .unwrap();
    assert_eq!(texts(&result.rows), vec!["b"]);

    let mut named = HashMap::new();
    named.insert("want".to_string(), SqlValue::Text("a".into()));
    let result = session
        .query_with("SELECT id FROM t WHERE v = :want", ParamBindings::named(named))
        .await
        .unwrap();
    assert_eq!(ints(&result.rows), vec![1]);
}

#[tokio::test]
async fn test_missing_parameter_is_misuse() {
    let db = db_with_rows().await;
    let session = db.session();
    let err = session
        .query("SELECT v FROM t WHERE id = ?")
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Misuse(_)));
}

#[tokio::test]
async fn test_count_and_sum() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session.query("SELECT count(*) FROM t").await.unwrap();
    assert_eq!(ints(&result.rows), vec![2]);

    let result = session
        .query("SELECT sum(id), min(v), max(v) FROM t")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0].to_string(), "3");
    assert_eq!(result.rows[0][1].to_string(), "a");
    assert_eq!(result.rows[0][2].to_string(), "b");
}

#[tokio::test]
async fn test_count_on_empty_table_is_zero() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE empty(id INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    let result = session.query("SELECT count(*) FROM empty").await.unwrap();
    assert_eq!(ints(&result.rows), vec![0]);
}

#[tokio::test]
async fn test_group_by_with_having() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE sales(id INTEGER PRIMARY KEY, region TEXT, amount INTEGER); \
             INSERT INTO sales VALUES (1,'east',10),(2,'east',20),(3,'west',5)",
        )
        .await
        .unwrap();
    let result = session
        .query(
            "SELECT region, sum(amount) AS total FROM sales \
             GROUP BY region HAVING sum(amount) > 6 ORDER BY region",
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0][0].to_string(), "east");
    assert_eq!(result.rows[0][1].to_string(), "30");
}

#[tokio::test]
async fn test_sum_skips_nulls() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE n(id INTEGER PRIMARY KEY, x INTEGER); \
             INSERT INTO n VALUES (1, 5),(2, NULL),(3, 7)",
        )
        .await
        .unwrap();
    let result = session.query("SELECT sum(x), count(x), count(*) FROM n").await.unwrap();
    assert_eq!(result.rows[0][0].to_string(), "12");
    assert_eq!(result.rows[0][1].to_string(), "2");
    assert_eq!(result.rows[0][2].to_string(), "3");
}

#[tokio::test]
async fn test_join_with_residual_like() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session
        .query("SELECT a.id FROM t a JOIN t b ON a.id = b.id WHERE a.v LIKE 'a%'")
        .await
        .unwrap();
    assert_eq!(ints(&result.rows), vec![1]);

    let plan = session
        .query("EXPLAIN SELECT a.id FROM t a JOIN t b ON a.id = b.id WHERE a.v LIKE 'a%'")
        .await
        .unwrap();
    let rendered = texts(&plan.rows).join("\n");
    assert!(rendered.contains("BloomJoin"), "expected hash join: {rendered}");
    assert!(rendered.contains("Filter"), "expected residual filter: {rendered}");
}

#[tokio::test]
async fn test_left_join_pads_unmatched() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE l(id INTEGER PRIMARY KEY); \
             CREATE TABLE r(id INTEGER PRIMARY KEY, l_id INTEGER); \
             INSERT INTO l VALUES (1),(2); \
             INSERT INTO r VALUES (10, 1)",
        )
        .await
        .unwrap();
    let result = session
        .query("SELECT l.id, r.id FROM l LEFT JOIN r ON r.l_id = l.id ORDER BY l.id")
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0][1].to_string(), "10");
    assert!(result.rows[1][1].is_null());
}

#[tokio::test]
async fn test_right_join_emits_unmatched_build_rows() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE l(id INTEGER PRIMARY KEY); \
             CREATE TABLE r(id INTEGER PRIMARY KEY, l_id INTEGER); \
             INSERT INTO l VALUES (1); \
             INSERT INTO r VALUES (10, 1),(11, 99)",
        )
        .await
        .unwrap();
    let result = session
        .query("SELECT l.id, r.id FROM l RIGHT JOIN r ON r.l_id = l.id")
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 2);
    let unmatched: Vec<_> = result
        .rows
        .iter()
        .filter(|row| row[0].is_null())
        .collect();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0][1].to_string(), "11");
}

#[tokio::test]
async fn test_distinct_and_elision() {
    let db = db_with_rows().await;
    let session = db.session();
    // id is the primary key, so DISTINCT is redundant and elided; results
    // must be identical either way.
    let with = session.query("SELECT DISTINCT id FROM t").await.unwrap();
    let without = session.query("SELECT id FROM t").await.unwrap();
    assert_eq!(ints(&with.rows), ints(&without.rows));

    session
        .execute("INSERT INTO t VALUES (3,'a')")
        .await
        .unwrap();
    let result = session
        .query("SELECT DISTINCT v FROM t ORDER BY v")
        .await
        .unwrap();
    assert_eq!(texts(&result.rows), vec!["a", "b"]);
}

#[tokio::test]
async fn test_set_operations() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE a(x INTEGER PRIMARY KEY); \
             CREATE TABLE b(x INTEGER PRIMARY KEY); \
             INSERT INTO a VALUES (1),(2),(3); \
             INSERT INTO b VALUES (2),(3),(4)",
        )
        .await
        .unwrap();

    let union = session
        .query("SELECT x FROM a UNION SELECT x FROM b ORDER BY x")
        .await
        .unwrap();
    assert_eq!(ints(&union.rows), vec![1, 2, 3, 4]);

    let union_all = session
        .query("SELECT x FROM a UNION ALL SELECT x FROM b")
        .await
        .unwrap();
    assert_eq!(union_all.rows.len(), 6);

    let intersect = session
        .query("SELECT x FROM a INTERSECT SELECT x FROM b ORDER BY x")
        .await
        .unwrap();
    assert_eq!(ints(&intersect.rows), vec![2, 3]);

    let except = session
        .query("SELECT x FROM a EXCEPT SELECT x FROM b")
        .await
        .unwrap();
    assert_eq!(ints(&except.rows), vec![1]);
}

#[tokio::test]
async fn test_recursive_cte_sum() {
    let db = Database::new();
    let session = db.session();
    let result = session
        .query(
            "WITH RECURSIVE r(n) AS (SELECT 1 UNION ALL SELECT n+1 FROM r WHERE n < 5) \
             SELECT sum(n) FROM r",
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0][0].to_string(), "15");
}

#[tokio::test]
async fn test_recursive_cte_iteration_limit() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("PRAGMA recursive_cte_limit = 3")
        .await
        .unwrap();
    let err = session
        .query(
            "WITH RECURSIVE r(n) AS (SELECT 1 UNION ALL SELECT n+1 FROM r WHERE n < 100) \
             SELECT count(*) FROM r",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QuereusError::Runtime(_)));
    assert!(err.to_string().contains("iterations"));
}

#[tokio::test]
async fn test_non_recursive_cte() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session
        .query("WITH big(id) AS (SELECT id FROM t WHERE id > 1) SELECT id FROM big")
        .await
        .unwrap();
    assert_eq!(ints(&result.rows), vec![2]);
}

#[tokio::test]
async fn test_row_number_window() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE w(id INTEGER PRIMARY KEY, grp TEXT); \
             INSERT INTO w VALUES (1,'x'),(2,'x'),(3,'y')",
        )
        .await
        .unwrap();
    let result = session
        .query(
            "SELECT grp, row_number() OVER (PARTITION BY grp ORDER BY id) AS rn \
             FROM w ORDER BY id",
        )
        .await
        .unwrap();
    let rns: Vec<String> = result.rows.iter().map(|r| r[1].to_string()).collect();
    assert_eq!(rns, vec!["1", "2", "1"]);
}

#[tokio::test]
async fn test_scalar_and_in_subqueries() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session
        .query("SELECT (SELECT max(id) FROM t)")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0].to_string(), "2");

    let result = session
        .query("SELECT v FROM t WHERE id IN (SELECT id FROM t WHERE v = 'b')")
        .await
        .unwrap();
    assert_eq!(texts(&result.rows), vec!["b"]);

    let result = session
        .query("SELECT v FROM t WHERE EXISTS (SELECT 1 FROM t WHERE id = 99)")
        .await
        .unwrap();
    assert!(result.rows.is_empty());
}

#[tokio::test]
async fn test_case_cast_between_in() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session
        .query(
            "SELECT CASE WHEN id = 1 THEN 'one' ELSE 'other' END, \
                    CAST('12abc' AS INTEGER), \
                    id BETWEEN 1 AND 1, \
                    id IN (2, 3) \
             FROM t ORDER BY id",
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0][0].to_string(), "one");
    assert_eq!(result.rows[0][1].to_string(), "12");
    assert_eq!(result.rows[0][2].to_string(), "1");
    assert_eq!(result.rows[0][3].to_string(), "0");
    assert_eq!(result.rows[1][0].to_string(), "other");
    assert_eq!(result.rows[1][3].to_string(), "1");
}

#[tokio::test]
async fn test_three_valued_null_comparisons() {
    let db = db_with_rows().await;
    let session = db.session();
    // NULL = NULL is unknown, so no rows pass.
    let result = session
        .query("SELECT id FROM t WHERE NULL = NULL")
        .await
        .unwrap();
    assert!(result.rows.is_empty());

    let result = session
        .query("SELECT id FROM t WHERE v IS NOT NULL ORDER BY id")
        .await
        .unwrap();
    assert_eq!(ints(&result.rows), vec![1, 2]);
}

#[tokio::test]
async fn test_limit_offset() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE seq(n INTEGER PRIMARY KEY)")
        .await
        .unwrap();
    session
        .execute("INSERT INTO seq VALUES (1),(2),(3),(4),(5)")
        .await
        .unwrap();
    let result = session
        .query("SELECT n FROM seq ORDER BY n LIMIT 2 OFFSET 1")
        .await
        .unwrap();
    assert_eq!(ints(&result.rows), vec![2, 3]);
}

#[tokio::test]
async fn test_views_expand_inline() {
    let db = db_with_rows().await;
    let session = db.session();
    session
        .execute("CREATE VIEW firsts AS SELECT id, v FROM t WHERE id = 1")
        .await
        .unwrap();
    let result = session.query("SELECT v FROM firsts").await.unwrap();
    assert_eq!(texts(&result.rows), vec!["a"]);

    session.execute("DROP VIEW firsts").await.unwrap();
    assert!(session.query("SELECT v FROM firsts").await.is_err());
}

#[tokio::test]
async fn test_insert_returning_and_defaults() {
    let db = Database::new();
    let session = db.session();
    session
        .execute(
            "CREATE TABLE d(id INTEGER PRIMARY KEY, v TEXT DEFAULT 'unset', n INTEGER)",
        )
        .await
        .unwrap();
    let outcome = session
        .execute("INSERT INTO d(id) VALUES (1) RETURNING id, v, n")
        .await
        .unwrap();
    let ExecOutcome::Rows(result) = outcome else {
        panic!("RETURNING should yield rows");
    };
    assert_eq!(result.rows[0][0].to_string(), "1");
    assert_eq!(result.rows[0][1].to_string(), "unset");
    assert!(result.rows[0][2].is_null());
}

#[tokio::test]
async fn test_update_and_delete_counts() {
    let db = db_with_rows().await;
    let session = db.session();
    let outcome = session
        .execute("UPDATE t SET v = upper(v) WHERE id >= 1")
        .await
        .unwrap();
    assert!(matches!(outcome, ExecOutcome::Affected(2)));

    let result = session
        .query("SELECT v FROM t ORDER BY id")
        .await
        .unwrap();
    assert_eq!(texts(&result.rows), vec!["A", "B"]);

    let outcome = session.execute("DELETE FROM t WHERE id = 1").await.unwrap();
    assert!(matches!(outcome, ExecOutcome::Affected(1)));
    let result = session.query("SELECT count(*) FROM t").await.unwrap();
    assert_eq!(ints(&result.rows), vec![1]);
}

#[tokio::test]
async fn test_delete_returning_old_values() {
    let db = db_with_rows().await;
    let session = db.session();
    let outcome = session
        .execute("DELETE FROM t WHERE id = 2 RETURNING v")
        .await
        .unwrap();
    let ExecOutcome::Rows(result) = outcome else {
        panic!("RETURNING should yield rows");
    };
    assert_eq!(texts(&result.rows), vec!["b"]);
}

#[tokio::test]
async fn test_insert_affinity_coercion() {
    let db = Database::new();
    let session = db.session();
    session
        .execute("CREATE TABLE c(id INTEGER PRIMARY KEY, n INTEGER)")
        .await
        .unwrap();
    session
        .execute("INSERT INTO c VALUES ('1', '42')")
        .await
        .unwrap();
    let result = session.query("SELECT n FROM c WHERE id = 1").await.unwrap();
    assert!(matches!(result.rows[0][0], SqlValue::Integer(42)));
}

#[tokio::test]
async fn test_unknown_names_error() {
    let db = db_with_rows().await;
    let session = db.session();
    assert!(session.query("SELECT nope FROM t").await.is_err());
    assert!(session.query("SELECT v FROM missing").await.is_err());
    assert!(session.query("SELECT no_such_fn(v) FROM t").await.is_err());
    let err = session
        .query("SELECT id FROM t a JOIN t b ON a.id = b.id")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ambiguous"));
}

#[tokio::test]
async fn test_prepared_statement_reuse() {
    let db = db_with_rows().await;
    let session = db.session();
    let prepared = session.prepare("SELECT v FROM t WHERE id = ?").unwrap();
    assert_eq!(prepared.columns()[0].name, "v");

    for (id, expected) in [(1i64, "a"), (2, "b")] {
        let outcome = session
            .execute_prepared(
                &prepared,
                ParamBindings::positional(vec![SqlValue::Integer(id)]),
            )
            .await
            .unwrap();
        let ExecOutcome::Rows(result) = outcome else {
            panic!("expected rows");
        };
        assert_eq!(texts(&result.rows), vec![expected]);
    }
}

#[tokio::test]
async fn test_generate_series_table_function() {
    let db = Database::new();
    let session = db.session();
    let result = session
        .query("SELECT sum(value) FROM generate_series WHERE start = 1 AND stop = 5")
        .await
        .unwrap();
    assert_eq!(result.rows[0][0].to_string(), "15");

    // Hidden argument columns are excluded from * expansion.
    let result = session
        .query("SELECT * FROM generate_series WHERE start = 1 AND stop = 3")
        .await
        .unwrap();
    assert_eq!(result.column_names(), vec!["value"]);
    assert_eq!(result.rows.len(), 3);

    // Without a stop bound the module refuses the access path.
    assert!(session
        .query("SELECT value FROM generate_series")
        .await
        .is_err());
}

#[tokio::test]
async fn test_collate_nocase() {
    let db = db_with_rows().await;
    let session = db.session();
    let result = session
        .query("SELECT id FROM t WHERE v = 'A' COLLATE NOCASE")
        .await
        .unwrap();
    assert_eq!(ints(&result.rows), vec![1]);
}
