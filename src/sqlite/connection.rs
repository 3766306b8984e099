use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use rusqlite::OpenFlags;

use crate::capability::{Connection, Engine, OpenOptions, PrepareOptions, Statement};
use crate::error::SqlLeaseError;

use super::statement::{CompiledStatement, Phase, SqliteStatement};

/// Default engine: one `rusqlite::Connection` per physical handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct RusqliteEngine;

impl Engine for RusqliteEngine {
    fn open(&self, options: &OpenOptions) -> Result<Box<dyn Connection>, SqlLeaseError> {
        let flags = if options.readonly {
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::default()
        };
        let conn = rusqlite::Connection::open_with_flags(&options.path, flags)?;
        conn.busy_timeout(options.busy_timeout)?;
        if !options.readonly {
            let _mode: String = conn.pragma_update_and_check(
                None,
                "journal_mode",
                options.journal_mode.as_pragma(),
                |row| row.get(0),
            )?;
        }
        Ok(Box::new(SqliteConnection::new(conn)))
    }
}

/// A live statement as the connection tracks it.
pub(super) struct Registered {
    pub(super) sql: String,
    persist: bool,
    pub(super) phase: Phase,
}

/// State shared by a connection and every statement it prepared.
///
/// Compiled statements own a clone of the connection `Rc` and live in the
/// registry, so closing can drop them all before the connection itself.
pub(super) struct Shared {
    conn: RefCell<Option<Rc<rusqlite::Connection>>>,
    registry: RefCell<BTreeMap<u64, Registered>>,
    next_id: Cell<u64>,
}

impl Shared {
    /// Compile `sql` against the current schema.
    pub(super) fn compile(&self, sql: &str) -> Result<CompiledStatement, SqlLeaseError> {
        let conn = self
            .conn
            .borrow()
            .as_ref()
            .map(Rc::clone)
            .ok_or_else(closed_error)?;
        CompiledStatement::try_new(conn, |conn| conn.prepare(sql)).map_err(SqlLeaseError::from)
    }

    /// Run `func` on the registry entry of statement `id`.
    pub(super) fn with_entry<T>(
        &self,
        id: u64,
        func: impl FnOnce(&mut Registered) -> Result<T, SqlLeaseError>,
    ) -> Result<T, SqlLeaseError> {
        if !self.is_open() {
            return Err(closed_error());
        }
        let mut registry = self.registry.borrow_mut();
        let entry = registry
            .get_mut(&id)
            .ok_or_else(|| SqlLeaseError::protocol(format!("statement {id} is not registered")))?;
        func(entry)
    }

    pub(super) fn unregister(&self, id: u64) {
        // the entry drops its compiled statement outside the registry borrow
        let removed = self.registry.borrow_mut().remove(&id);
        drop(removed);
    }

    fn is_open(&self) -> bool {
        self.conn.borrow().is_some()
    }
}

/// Capability connection backed by rusqlite.
pub struct SqliteConnection {
    shared: Rc<Shared>,
}

impl SqliteConnection {
    #[must_use]
    pub fn new(conn: rusqlite::Connection) -> Self {
        Self {
            shared: Rc::new(Shared {
                conn: RefCell::new(Some(Rc::new(conn))),
                registry: RefCell::new(BTreeMap::new()),
                next_id: Cell::new(1),
            }),
        }
    }

    /// SQL of statements that are neither finalized nor persisted, oldest first.
    #[must_use]
    pub fn outstanding(&self) -> Vec<String> {
        self.shared
            .registry
            .borrow()
            .values()
            .filter(|entry| !entry.persist)
            .map(|entry| entry.sql.clone())
            .collect()
    }
}

impl Connection for SqliteConnection {
    fn prepare(
        &mut self,
        sql: &str,
        options: PrepareOptions,
    ) -> Result<Box<dyn Statement>, SqlLeaseError> {
        if !self.shared.is_open() {
            return Err(closed_error());
        }
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);

        // A compile error is not reported here; the statement retries the
        // compile on each use and reports the error from there.
        let phase = match self.shared.compile(sql) {
            Ok(compiled) => Phase::Ready(compiled),
            Err(_) => Phase::Uncompiled,
        };
        self.shared.registry.borrow_mut().insert(
            id,
            Registered {
                sql: sql.to_string(),
                persist: options.persist,
                phase,
            },
        );
        Ok(Box::new(SqliteStatement::new(
            Rc::clone(&self.shared),
            id,
            sql.to_string(),
        )))
    }

    fn close(&mut self) -> Result<(), SqlLeaseError> {
        if let Some(sql) = self.outstanding().into_iter().next() {
            return Err(SqlLeaseError::ResourceLeak { sql });
        }
        // persisted statements hold the connection; they die with it
        let persisted = std::mem::take(&mut *self.shared.registry.borrow_mut());
        drop(persisted);
        let Some(conn) = self.shared.conn.borrow_mut().take() else {
            return Ok(());
        };
        let conn = Rc::try_unwrap(conn).map_err(|conn| {
            *self.shared.conn.borrow_mut() = Some(conn);
            SqlLeaseError::ConnectionError("SQLite connection is still borrowed".into())
        })?;
        conn.close().map_err(|(conn, err)| {
            *self.shared.conn.borrow_mut() = Some(Rc::new(conn));
            SqlLeaseError::SqliteError(err)
        })
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("open", &self.shared.is_open())
            .field("statements", &self.shared.registry.borrow().len())
            .finish()
    }
}

fn closed_error() -> SqlLeaseError {
    SqlLeaseError::ConnectionError("SQLite connection is closed".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Params, StepResult, Value};

    fn open_memory() -> Box<dyn Connection> {
        RusqliteEngine
            .open(&OpenOptions::new(":memory:"))
            .expect("open in-memory database")
    }

    fn exec(conn: &mut Box<dyn Connection>, sql: &str) {
        let mut stmt = conn.prepare(sql, PrepareOptions::default()).unwrap();
        stmt.run().unwrap();
        stmt.finalize().unwrap();
    }

    #[test]
    fn close_reports_first_unfinalized_statement() {
        let mut conn = open_memory();
        let mut persisted = conn
            .prepare("SELECT 1", PrepareOptions::persisted())
            .unwrap();
        let mut leaked = conn
            .prepare("SELECT 2 AS leaked", PrepareOptions::default())
            .unwrap();

        match conn.close() {
            Err(SqlLeaseError::ResourceLeak { sql }) => assert_eq!(sql, "SELECT 2 AS leaked"),
            other => panic!("expected leak error, got {other:?}"),
        }

        leaked.finalize().unwrap();
        leaked.finalize().unwrap();
        assert!(conn.close().is_ok());
        // persisted statements never block close, but are dead afterwards
        assert!(persisted.step(None).is_err());
    }

    #[test]
    fn step_after_done_is_quiet() {
        let mut conn = open_memory();
        exec(&mut conn, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)");
        exec(&mut conn, "INSERT INTO t (name) VALUES ('a'), ('b'), ('c')");

        let mut stmt = conn
            .prepare("SELECT name FROM t ORDER BY id", PrepareOptions::default())
            .unwrap();
        let first = stmt.step(Some(2)).unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(!first.done);
        let second = stmt.step(Some(2)).unwrap();
        assert_eq!(second.rows, vec![vec![Value::from("c")]]);
        assert!(second.done);
        assert_eq!(stmt.step(Some(2)).unwrap(), StepResult::exhausted());

        stmt.reset(false).unwrap();
        assert_eq!(stmt.step(None).unwrap().rows.len(), 3);
        stmt.finalize().unwrap();
    }

    #[test]
    fn bind_only_overwrites_named_slots() {
        let mut conn = open_memory();
        let mut stmt = conn
            .prepare("SELECT :a, :b", PrepareOptions::default())
            .unwrap();
        stmt.bind(&Params::named([("a", 1), ("b", 2)])).unwrap();
        stmt.bind(&Params::named([("b", 5)])).unwrap();
        let rows = stmt.step(None).unwrap().rows;
        assert_eq!(rows, vec![vec![Value::Integer(1), Value::Integer(5)]]);

        stmt.reset(true).unwrap();
        let rows = stmt.step(None).unwrap().rows;
        assert_eq!(rows, vec![vec![Value::Null, Value::Null]]);

        assert!(stmt.bind(&Params::named([("missing", 1)])).is_err());
        stmt.finalize().unwrap();
    }

    #[test]
    fn prepare_errors_are_deferred() {
        let mut conn = open_memory();
        let mut stmt = conn
            .prepare("SELEKT nonsense", PrepareOptions::default())
            .expect("prepare itself does not fail");
        assert!(stmt.columns().is_err());
        assert!(stmt.step(None).is_err());
        assert!(stmt.run().is_err());
        stmt.finalize().unwrap();
        assert!(conn.close().is_ok());
    }

    #[test]
    fn run_reports_changes_and_rowid() {
        let mut conn = open_memory();
        exec(&mut conn, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)");
        let mut insert = conn
            .prepare("INSERT INTO t (name) VALUES (?1)", PrepareOptions::default())
            .unwrap();
        insert.bind(&Params::positional(["x"])).unwrap();
        let first = insert.run().unwrap();
        assert_eq!(first.changes, 1);
        assert_eq!(first.last_insert_row_id, 1);
        insert.reset(false).unwrap();
        let second = insert.run().unwrap();
        assert_eq!(second.last_insert_row_id, 2);
        insert.finalize().unwrap();
    }

    #[test]
    fn failed_compile_recovers_once_the_table_exists() {
        let mut conn = open_memory();
        let mut stmt = conn
            .prepare("SELECT v FROM later WHERE v = ?1", PrepareOptions::persisted())
            .unwrap();
        // values are kept while the SQL cannot compile
        stmt.bind(&Params::positional([7])).unwrap();
        assert!(stmt.step(None).is_err());
        assert!(stmt.columns().is_err());

        exec(&mut conn, "CREATE TABLE later (v INTEGER)");
        exec(&mut conn, "INSERT INTO later (v) VALUES (7), (8)");

        assert_eq!(stmt.columns().unwrap(), ["v"]);
        let step = stmt.step(None).unwrap();
        assert_eq!(step.rows, vec![vec![Value::Integer(7)]]);
        assert!(step.done);
        stmt.finalize().unwrap();
    }

    #[test]
    fn added_column_shows_up_in_later_steps() {
        let mut conn = open_memory();
        exec(&mut conn, "CREATE TABLE t (a INTEGER)");
        exec(&mut conn, "INSERT INTO t (a) VALUES (1)");

        let mut stmt = conn
            .prepare("SELECT * FROM t", PrepareOptions::default())
            .unwrap();
        assert_eq!(stmt.columns().unwrap(), ["a"]);
        assert_eq!(stmt.step(None).unwrap().rows, vec![vec![Value::Integer(1)]]);
        stmt.reset(false).unwrap();

        exec(&mut conn, "ALTER TABLE t ADD COLUMN b TEXT DEFAULT 'x'");

        let step = stmt.step(None).unwrap();
        assert_eq!(step.columns, ["a", "b"]);
        assert_eq!(step.rows, vec![vec![Value::Integer(1), Value::from("x")]]);
        assert_eq!(stmt.columns().unwrap(), ["a", "b"]);
        stmt.finalize().unwrap();
    }

    #[test]
    fn step_advances_only_as_far_as_asked() {
        let mut conn = open_memory();
        let mut stmt = conn
            .prepare(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c",
                PrepareOptions::default(),
            )
            .unwrap();

        let first = stmt.step(Some(3)).unwrap();
        assert_eq!(
            first.rows,
            vec![
                vec![Value::Integer(1)],
                vec![Value::Integer(2)],
                vec![Value::Integer(3)],
            ]
        );
        assert!(!first.done);
        assert_eq!(first.columns, ["x"]);

        let second = stmt.step(Some(2)).unwrap();
        assert_eq!(second.rows, vec![vec![Value::Integer(4)], vec![Value::Integer(5)]]);

        stmt.reset(false).unwrap();
        assert_eq!(stmt.step(Some(1)).unwrap().rows, vec![vec![Value::Integer(1)]]);
        stmt.finalize().unwrap();
        assert!(conn.close().is_ok());
    }

    #[test]
    fn run_restarts_a_statement_left_mid_stream() {
        let mut conn = open_memory();
        exec(&mut conn, "CREATE TABLE t (id INTEGER PRIMARY KEY)");
        exec(&mut conn, "INSERT INTO t (id) VALUES (1), (2), (3)");

        let mut stmt = conn
            .prepare("SELECT id FROM t ORDER BY id", PrepareOptions::default())
            .unwrap();
        assert_eq!(stmt.step(Some(1)).unwrap().rows.len(), 1);
        assert!(stmt.run().is_ok());
        assert_eq!(stmt.step(None).unwrap().rows.len(), 3);
        stmt.finalize().unwrap();
    }
}
