use sqlite_lease::prelude::*;
use tempfile::tempdir;

fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

async fn open(prefix: &str) -> Result<Database, SqlLeaseError> {
    let db = Database::builder(unique_db_path(prefix))
        .max_in_flight_batches(2)
        .build()
        .await?;
    db.run("CREATE TABLE events (seq INTEGER NOT NULL, label TEXT)", &Params::none())
        .await?;
    Ok(db)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thousand_queued_inserts_land_in_order() -> Result<(), SqlLeaseError> {
    let db = open("thousand").await?;
    let conn = db.writer().await?;

    let insert = conn.prepare("INSERT INTO events (seq, label) VALUES (?1, ?2)")?;
    let mut pipeline = conn.pipeline();
    for i in 0..1000_i64 {
        let params = Params::positional([Value::Integer(i), Value::from(format!("e{i}"))]);
        pipeline.run(&insert, &params)?;
    }
    assert_eq!(pipeline.len(), 1000);
    pipeline.flush().await?;
    assert!(pipeline.is_empty());
    insert.finalize();

    let rows = conn
        .select("SELECT count(*), min(rowid), max(rowid) FROM events", &Params::none())
        .await?;
    assert_eq!(
        rows.rows[0].values(),
        [Value::Integer(1000), Value::Integer(1), Value::Integer(1000)]
    );

    let ordered = conn
        .select("SELECT count(*) FROM events WHERE seq = rowid - 1", &Params::none())
        .await?;
    assert_eq!(ordered.scalar(), Some(&Value::Integer(1000)));

    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_reports_the_first_failure() -> Result<(), SqlLeaseError> {
    let db = open("failure").await?;
    let conn = db.writer().await?;

    let mut pipeline = conn.pipeline();
    pipeline.run_sql("INSERT INTO events (seq) VALUES (1)", &Params::none())?;
    pipeline.run_sql("INSERT INTO events (seq) VALUES (NULL)", &Params::none())?;
    pipeline.run_sql("INSERT INTO events (seq) VALUES (3)", &Params::none())?;
    assert!(pipeline.flush().await.is_err());

    // later runs still executed
    let rows = conn
        .select("SELECT seq FROM events ORDER BY seq", &Params::none())
        .await?;
    let seqs: Vec<_> = rows
        .rows
        .iter()
        .filter_map(|row| row.get_by_index(0).and_then(Value::as_int))
        .collect();
    assert_eq!(seqs, [1, 3]);
    conn.sync().await?;

    drop(conn);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statement_from_another_connection_is_rejected() -> Result<(), SqlLeaseError> {
    let db = open("foreign").await?;
    let writer = db.writer().await?;
    let reader = db.reader().await?;

    let foreign = reader.prepare("SELECT 1")?;
    let mut pipeline = writer.pipeline();
    let err = pipeline.run(&foreign, &Params::none()).unwrap_err();
    assert!(matches!(err, SqlLeaseError::ProtocolViolation(_)), "{err:?}");
    assert!(pipeline.is_empty());

    drop(foreign);
    drop(reader);
    drop(writer);
    db.close().await
}
