use futures_util::StreamExt;
use sqlite_lease::prelude::*;
use tempfile::tempdir;

fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    // Leak the tempdir so the file persists for the duration of the test binary.
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

async fn open(prefix: &str) -> Result<Database, SqlLeaseError> {
    let db = Database::builder(unique_db_path(prefix))
        .max_connections(2)
        .build()
        .await?;
    db.run(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
        &Params::none(),
    )
    .await?;
    Ok(db)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepared_run_reports_changes() -> Result<(), SqlLeaseError> {
    let db = open("changes").await?;
    let conn = db.writer().await?;

    let insert = conn.prepare("INSERT INTO items (name) VALUES (?1)")?;
    let first = insert.run(&Params::positional(["alpha"])).await?;
    assert_eq!(first.changes, 1);
    assert_eq!(first.last_insert_row_id, 1);
    let second = insert.run(&Params::positional(["beta"])).await?;
    assert_eq!(second.last_insert_row_id, 2);
    insert.finalize();

    let changes = conn.changes().await?;
    assert_eq!(changes.changes, 1);
    assert_eq!(changes.last_insert_row_id, 2);

    let updated = conn
        .run("UPDATE items SET name = upper(name)", &Params::none())
        .await?;
    assert_eq!(updated.changes, 2);
    let rows = conn
        .select("SELECT name FROM items ORDER BY id", &Params::none())
        .await?;
    let names: Vec<_> = rows
        .rows
        .iter()
        .filter_map(|row| row.get("name").and_then(Value::as_text).map(str::to_owned))
        .collect();
    assert_eq!(names, ["ALPHA", "BETA"]);

    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bind_overwrites_only_given_slots() -> Result<(), SqlLeaseError> {
    let db = open("bind").await?;
    let conn = db.writer().await?;

    let query = conn
        .prepare_with("SELECT ?1 AS a, ?2 AS b", &Params::positional([1_i64, 2]))
        .await?;
    let rows = query.select(&Params::positional([10_i64])).await?;
    assert_eq!(rows.column_names(), ["a", "b"]);
    let row = &rows.rows[0];
    assert_eq!(row.get("a"), Some(&Value::Integer(10)));
    assert_eq!(row.get("b"), Some(&Value::Integer(2)));

    let named = conn.prepare("SELECT :x AS x")?;
    let rows = named.select(&Params::named([("x", "named")])).await?;
    assert_eq!(rows.scalar().and_then(Value::as_text), Some("named"));

    let err = named
        .bind(&Params::named([("missing", 1_i64)]))
        .await
        .unwrap_err();
    assert!(matches!(err, SqlLeaseError::Engine(_)), "{err:?}");

    drop(named);
    drop(query);
    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compile_errors_surface_on_first_use() -> Result<(), SqlLeaseError> {
    let db = open("deferred").await?;
    let conn = db.writer().await?;

    let bad = conn.prepare("SELEKT nonsense")?;
    assert!(bad.run(&Params::none()).await.is_err());
    assert!(bad.columns().await.is_err());
    bad.finalize();

    // the handle is still healthy afterwards
    conn.sync().await?;
    let rows = conn.select("SELECT 1 AS one", &Params::none()).await?;
    assert_eq!(rows.scalar(), Some(&Value::Integer(1)));

    assert!(conn.run("INSERT INTO nowhere VALUES (1)", &Params::none()).await.is_err());
    conn.sync().await?;

    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rows_stream_in_chunks() -> Result<(), SqlLeaseError> {
    let db = open("stream").await?;
    let conn = db.writer().await?;
    let insert = conn.prepare("INSERT INTO items (name) VALUES (?1)")?;
    for i in 0..10 {
        insert.run(&Params::positional([format!("item-{i}")])).await?;
    }
    drop(insert);

    let query = conn.prepare("SELECT id, name FROM items ORDER BY id")?;
    let mut rows = query.stream(&Params::none(), 4).await?;
    assert_eq!(rows.column_names(), ["id", "name"]);
    let mut sizes = Vec::new();
    while let Some(chunk) = rows.next_chunk().await? {
        sizes.push(chunk.len());
    }
    assert_eq!(sizes, [4, 4, 2]);
    drop(rows);

    // an abandoned stream resets the statement, so it starts over
    let mut rows = query.stream(&Params::none(), 3).await?;
    let first = rows.next_chunk().await?.expect("first chunk");
    assert_eq!(first.rows[0].get("id"), Some(&Value::Integer(1)));
    drop(rows);

    let chunks: Vec<_> = query
        .stream(&Params::none(), 5)
        .await?
        .into_stream()
        .collect()
        .await;
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(Result::is_ok));

    drop(query);
    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_statement_prepares_once_per_handle() -> Result<(), SqlLeaseError> {
    let db = open("pool_statement").await?;
    db.run(
        "INSERT INTO items (name) VALUES (?1), (?2)",
        &Params::positional(["a", "b"]),
    )
    .await?;

    let count = db.prepare("SELECT count(*) FROM items");
    for _ in 0..5 {
        let rows = count.select(&Params::none()).await?;
        assert_eq!(rows.scalar(), Some(&Value::Integer(2)));
    }
    let on_writer = count
        .select_with(&ReserveOptions::writer(), &Params::none())
        .await?;
    assert_eq!(on_writer.scalar(), Some(&Value::Integer(2)));

    let reader = db.reader().await?;
    reader.select(count.sql(), &Params::none()).await?;
    drop(reader);

    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sql_that_failed_to_compile_works_once_the_table_exists() -> Result<(), SqlLeaseError> {
    let db = open("recompile").await?;
    let conn = db.writer().await?;

    let sql = "SELECT v FROM later ORDER BY v";
    assert!(conn.select(sql, &Params::none()).await.is_err());
    let prepared = conn.prepare("SELECT count(*) FROM later")?;
    assert!(prepared.select(&Params::none()).await.is_err());

    conn.run("CREATE TABLE later (v INTEGER)", &Params::none())
        .await?;
    conn.run("INSERT INTO later (v) VALUES (1), (2)", &Params::none())
        .await?;

    let rows = conn.select(sql, &Params::none()).await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.rows[1].get("v"), Some(&Value::Integer(2)));
    let count = prepared.select(&Params::none()).await?;
    assert_eq!(count.scalar(), Some(&Value::Integer(2)));

    drop(prepared);
    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn added_column_appears_in_later_selects() -> Result<(), SqlLeaseError> {
    let db = open("alter").await?;
    let conn = db.writer().await?;
    conn.run("INSERT INTO items (name) VALUES ('a')", &Params::none())
        .await?;

    let all = conn.prepare("SELECT * FROM items")?;
    let before = conn.select("SELECT * FROM items", &Params::none()).await?;
    assert_eq!(before.column_names(), ["id", "name"]);
    assert_eq!(all.columns().await?.len(), 2);
    assert_eq!(all.select(&Params::none()).await?.column_names(), ["id", "name"]);

    conn.run("ALTER TABLE items ADD COLUMN tag TEXT DEFAULT 'new'", &Params::none())
        .await?;

    let after = conn.select("SELECT * FROM items", &Params::none()).await?;
    assert_eq!(after.column_names(), ["id", "name", "tag"]);
    assert_eq!(after.rows[0].get("tag"), Some(&Value::from("new")));
    assert_eq!(*all.columns().await?, ["id", "name", "tag"]);
    let prepared = all.select(&Params::none()).await?;
    assert_eq!(prepared.rows[0].values().len(), 3);

    drop(all);
    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statement_cache_stays_bounded() -> Result<(), SqlLeaseError> {
    let db = Database::builder(unique_db_path("bounded"))
        .statement_cache_capacity(16)
        .build()
        .await?;
    let conn = db.writer().await?;

    for i in 0..2_000_i64 {
        let rows = conn
            .select(&format!("SELECT {i} AS n"), &Params::none())
            .await?;
        assert_eq!(rows.scalar(), Some(&Value::Integer(i)));
        assert!(conn.cached_statements() <= 16);
    }

    // evicted text is prepared again; recent text is still cached
    let first = conn.select("SELECT 0 AS n", &Params::none()).await?;
    assert_eq!(first.scalar(), Some(&Value::Integer(0)));
    let recent = conn.select("SELECT 1999 AS n", &Params::none()).await?;
    assert_eq!(recent.scalar(), Some(&Value::Integer(1999)));
    assert_eq!(conn.cached_statements(), 16);

    drop(conn);
    db.close().await
}
