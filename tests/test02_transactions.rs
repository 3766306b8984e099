use sqlite_lease::prelude::*;
use tempfile::tempdir;

fn unique_db_path(prefix: &str) -> String {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.db"));
    std::mem::forget(dir);
    path.to_string_lossy().into_owned()
}

async fn open(prefix: &str) -> Result<Database, SqlLeaseError> {
    let db = Database::builder(unique_db_path(prefix)).build().await?;
    db.run("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL)", &Params::none())
        .await?;
    Ok(db)
}

async fn row_count(db: &Database) -> Result<i64, SqlLeaseError> {
    let rows = db
        .writer()
        .await?
        .select("SELECT count(*) FROM ledger", &Params::none())
        .await?;
    Ok(rows.scalar().and_then(Value::as_int).unwrap_or(-1))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_body_rolls_everything_back() -> Result<(), SqlLeaseError> {
    let db = open("rollback").await?;

    let outcome: Result<(), SqlLeaseError> = db
        .transaction(TransactionOptions::default(), |tx| {
            Box::pin(async move {
                let insert = tx.prepare("INSERT INTO ledger (amount) VALUES (?1)")?;
                for i in 0..10_i64 {
                    insert.run(&Params::positional([i])).await?;
                }
                insert.finalize();
                tx.run("INSERT INTO ledger (id, amount) VALUES (1, 0)", &Params::none())
                    .await?;
                Ok(())
            })
        })
        .await;
    assert!(outcome.is_err());
    assert_eq!(row_count(&db).await?, 0);

    let total = db
        .transaction(TransactionOptions::kind(TransactionKind::Immediate), |tx| {
            Box::pin(async move {
                tx.run("INSERT INTO ledger (amount) VALUES (5), (7)", &Params::none())
                    .await?;
                let rows = tx
                    .select("SELECT sum(amount) FROM ledger", &Params::none())
                    .await?;
                Ok(rows.scalar().and_then(Value::as_int).unwrap_or(0))
            })
        })
        .await?;
    assert_eq!(total, 12);
    assert_eq!(row_count(&db).await?, 2);

    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finished_transaction_rejects_queries() -> Result<(), SqlLeaseError> {
    let db = open("terminal").await?;

    let mut tx = db.begin(TransactionOptions::default()).await?;
    assert_eq!(tx.kind(), TransactionKind::Exclusive);
    tx.run("INSERT INTO ledger (amount) VALUES (1)", &Params::none())
        .await?;
    tx.commit().await?;
    assert_eq!(tx.state(), TransactionState::Committed);

    // a second commit or a rollback after commit changes nothing
    tx.commit().await?;
    tx.rollback().await?;
    assert_eq!(tx.state(), TransactionState::Committed);

    let err = tx
        .run("INSERT INTO ledger (amount) VALUES (2)", &Params::none())
        .await
        .unwrap_err();
    assert!(matches!(err, SqlLeaseError::ProtocolViolation(_)), "{err:?}");
    assert!(tx.prepare("SELECT 1").is_err());
    drop(tx);

    assert_eq!(row_count(&db).await?, 1);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_rollback_releases_the_writer() -> Result<(), SqlLeaseError> {
    let db = open("explicit").await?;

    let mut tx = db.begin(TransactionOptions::default()).await?;
    tx.run("INSERT INTO ledger (amount) VALUES (1)", &Params::none())
        .await?;
    assert_eq!(db.writer_status().idle, 0);
    tx.rollback().await?;
    assert_eq!(tx.state(), TransactionState::RolledBack);
    assert_eq!(db.writer_status().idle, 1);

    assert_eq!(row_count(&db).await?, 0);
    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_transaction_rolls_back() -> Result<(), SqlLeaseError> {
    let db = open("dropped").await?;

    let tx = db.begin(TransactionOptions::default()).await?;
    tx.run("INSERT INTO ledger (amount) VALUES (1)", &Params::none())
        .await?;
    drop(tx);

    // the writer comes back only after the rollback ran
    assert_eq!(row_count(&db).await?, 0);
    let mut tx = db.begin(TransactionOptions::default()).await?;
    tx.run("INSERT INTO ledger (amount) VALUES (2)", &Params::none())
        .await?;
    tx.commit().await?;
    assert_eq!(row_count(&db).await?, 1);

    db.close().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readonly_transaction_runs_on_a_reader() -> Result<(), SqlLeaseError> {
    let db = open("readonly").await?;
    db.run("INSERT INTO ledger (amount) VALUES (3)", &Params::none())
        .await?;

    let mut tx = db.begin(TransactionOptions::read_only()).await?;
    assert_eq!(tx.kind(), TransactionKind::Deferred);
    assert!(tx.connection()?.name().starts_with("connection-"));
    let rows = tx.select("SELECT amount FROM ledger", &Params::none()).await?;
    assert_eq!(rows.scalar(), Some(&Value::Integer(3)));
    tx.commit().await?;

    db.close().await
}
