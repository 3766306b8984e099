use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use self_cell::self_cell;

use crate::capability::Statement;
use crate::error::SqlLeaseError;
use crate::types::{Params, RunResult, StepResult, Value};

use super::connection::Shared;
use super::values::{from_sqlite, normalize_name, to_sqlite};

type RawStatement<'conn> = rusqlite::Statement<'conn>;

self_cell!(
    /// A compiled statement together with the connection it borrows.
    pub(super) struct CompiledStatement {
        owner: Rc<rusqlite::Connection>,

        #[covariant]
        dependent: RawStatement,
    }
);

/// Where a registered statement is in its lifecycle.
pub(super) enum Phase {
    /// Not compiled yet, or the last compile failed.
    Uncompiled,
    Ready(CompiledStatement),
    /// Part way through a result set; the engine holds the cursor position.
    Stepping(CompiledStatement),
    /// Result set exhausted; stepping again is a quiet no-op until reset.
    Done(CompiledStatement),
}

impl Phase {
    fn take(&mut self) -> Phase {
        std::mem::replace(self, Phase::Uncompiled)
    }
}

/// Capability statement backed by a live rusqlite statement.
///
/// The compiled statement stays with the connection between calls and keeps
/// its cursor position, so `step(n)` advances the engine by at most `n`
/// rows. A failed compile is retried on the next use, which lets a statement
/// recover once the schema it refers to exists.
pub struct SqliteStatement {
    shared: Rc<Shared>,
    id: u64,
    sql: String,
    positional: BTreeMap<usize, Value>,
    named: BTreeMap<String, Value>,
    finalized: bool,
}

impl SqliteStatement {
    pub(super) fn new(shared: Rc<Shared>, id: u64, sql: String) -> Self {
        Self {
            shared,
            id,
            sql,
            positional: BTreeMap::new(),
            named: BTreeMap::new(),
            finalized: false,
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn ensure_live(&self) -> Result<(), SqlLeaseError> {
        if self.finalized {
            return Err(SqlLeaseError::protocol(format!(
                "statement has been finalized: {}",
                self.sql
            )));
        }
        Ok(())
    }

    /// The compiled statement with any open cursor closed.
    fn ready(&self, phase: Phase) -> Result<CompiledStatement, SqlLeaseError> {
        match phase {
            Phase::Ready(compiled) | Phase::Done(compiled) => Ok(compiled),
            Phase::Stepping(mut compiled) => {
                rewind(&mut compiled);
                Ok(compiled)
            }
            Phase::Uncompiled => self.shared.compile(&self.sql),
        }
    }

    /// Bind every slot of `stmt` from the stored values; unset slots are NULL.
    fn apply_bindings(&self, stmt: &mut rusqlite::Statement<'_>) -> Result<(), SqlLeaseError> {
        let mut slots = vec![Value::Null; stmt.parameter_count()];
        for (index, value) in &self.positional {
            let count = slots.len();
            let slot = index
                .checked_sub(1)
                .and_then(|at| slots.get_mut(at))
                .ok_or(rusqlite::Error::InvalidParameterCount(*index, count))?;
            *slot = value.clone();
        }
        for (name, value) in &self.named {
            let slot = stmt
                .parameter_index(name)?
                .and_then(|index| slots.get_mut(index - 1))
                .ok_or_else(|| rusqlite::Error::InvalidParameterName(name.clone()))?;
            *slot = value.clone();
        }
        for (offset, value) in slots.iter().enumerate() {
            stmt.raw_bind_parameter(offset + 1, to_sqlite(value))?;
        }
        Ok(())
    }

    fn check_params(
        stmt: &rusqlite::Statement<'_>,
        params: &Params,
    ) -> Result<(), SqlLeaseError> {
        match params {
            Params::Positional(values) => {
                let count = stmt.parameter_count();
                if values.len() > count {
                    return Err(SqlLeaseError::SqliteError(
                        rusqlite::Error::InvalidParameterCount(values.len(), count),
                    ));
                }
            }
            Params::Named(values) => {
                for name in values.keys().map(|name| normalize_name(name)) {
                    if stmt.parameter_index(&name)?.is_none() {
                        return Err(SqlLeaseError::SqliteError(
                            rusqlite::Error::InvalidParameterName(name),
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Statement for SqliteStatement {
    /// Store `params` for the next execution.
    ///
    /// Slots are checked against the compiled statement. While the SQL does
    /// not compile the values are stored unchecked; the compile error is
    /// reported by the next `columns`, `step` or `run`.
    fn bind(&mut self, params: &Params) -> Result<(), SqlLeaseError> {
        self.ensure_live()?;
        self.shared.with_entry(self.id, |entry| {
            if matches!(entry.phase, Phase::Uncompiled) {
                if let Ok(compiled) = self.shared.compile(&self.sql) {
                    entry.phase = Phase::Ready(compiled);
                }
            }
            match &entry.phase {
                Phase::Uncompiled => Ok(()),
                Phase::Ready(compiled) | Phase::Stepping(compiled) | Phase::Done(compiled) => {
                    Self::check_params(compiled.borrow_dependent(), params)
                }
            }
        })?;
        match params {
            Params::Positional(values) => {
                for (offset, value) in values.iter().enumerate() {
                    self.positional.insert(offset + 1, value.clone());
                }
            }
            Params::Named(values) => {
                for (name, value) in values {
                    self.named.insert(normalize_name(name), value.clone());
                }
            }
        }
        Ok(())
    }

    fn step(&mut self, count: Option<usize>) -> Result<StepResult, SqlLeaseError> {
        self.ensure_live()?;
        self.shared.with_entry(self.id, |entry| {
            let mut compiled = match entry.phase.take() {
                Phase::Done(compiled) => {
                    entry.phase = Phase::Done(compiled);
                    return Ok(StepResult::exhausted());
                }
                Phase::Stepping(compiled) => compiled,
                phase => {
                    let mut compiled = self.ready(phase)?;
                    compiled.with_dependent_mut(|_, stmt| self.apply_bindings(stmt))?;
                    compiled
                }
            };

            let limit = count.unwrap_or(usize::MAX);
            match compiled.with_dependent_mut(|_, stmt| pull_rows(stmt, limit)) {
                Ok((rows, done)) => {
                    let columns = column_names(compiled.borrow_dependent());
                    entry.phase = if done {
                        Phase::Done(compiled)
                    } else {
                        Phase::Stepping(compiled)
                    };
                    Ok(StepResult {
                        rows,
                        done,
                        columns,
                    })
                }
                Err(err) => {
                    // the engine resets a statement whose step failed
                    entry.phase = Phase::Ready(compiled);
                    Err(err)
                }
            }
        })
    }

    fn run(&mut self) -> Result<RunResult, SqlLeaseError> {
        self.ensure_live()?;
        self.shared.with_entry(self.id, |entry| {
            let mut compiled = self.ready(entry.phase.take())?;
            let outcome = compiled.with_dependent_mut(|conn, stmt| -> Result<_, SqlLeaseError> {
                self.apply_bindings(stmt)?;
                drain(stmt)?;
                Ok(RunResult {
                    changes: conn.changes(),
                    last_insert_row_id: conn.last_insert_rowid(),
                })
            });
            entry.phase = Phase::Ready(compiled);
            outcome
        })
    }

    /// Column names as the current schema defines them.
    fn columns(&mut self) -> Result<Vec<String>, SqlLeaseError> {
        self.ensure_live()?;
        self.shared.with_entry(self.id, |entry| {
            if let Phase::Stepping(compiled) = &entry.phase {
                return Ok(column_names(compiled.borrow_dependent()));
            }
            let fresh = self.shared.compile(&self.sql)?;
            let columns = column_names(fresh.borrow_dependent());
            entry.phase = match entry.phase.take() {
                Phase::Done(_) => Phase::Done(fresh),
                _ => Phase::Ready(fresh),
            };
            Ok(columns)
        })
    }

    fn reset(&mut self, clear_bindings: bool) -> Result<(), SqlLeaseError> {
        self.ensure_live()?;
        if clear_bindings {
            self.positional.clear();
            self.named.clear();
        }
        if let Err(err) = self.shared.with_entry(self.id, |entry| {
            entry.phase = match entry.phase.take() {
                Phase::Uncompiled => Phase::Uncompiled,
                Phase::Ready(compiled) | Phase::Done(compiled) => Phase::Ready(compiled),
                Phase::Stepping(mut compiled) => {
                    rewind(&mut compiled);
                    Phase::Ready(compiled)
                }
            };
            Ok(())
        }) {
            // nothing left to reset on a closed connection
            tracing::trace!(sql = %self.sql, error = %err, "reset skipped");
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), SqlLeaseError> {
        if !self.finalized {
            self.finalized = true;
            self.shared.unregister(self.id);
        }
        Ok(())
    }
}

/// Advance `stmt` by up to `limit` rows; `true` once the result set ended.
///
/// Each call wraps the statement in a fresh `Rows`. An unfinished `Rows` is
/// forgotten instead of dropped, because dropping it would reset the
/// statement and lose the cursor position.
fn pull_rows(
    stmt: &mut rusqlite::Statement<'_>,
    limit: usize,
) -> Result<(Vec<Vec<Value>>, bool), SqlLeaseError> {
    let mut rows = stmt.raw_query();
    let mut out: Vec<Vec<Value>> = Vec::new();
    while out.len() < limit {
        let Some(row) = rows.next()? else {
            return Ok((out, true));
        };
        // a re-prepare after a schema change can change the row shape
        let width = row.as_ref().column_count();
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(from_sqlite(row.get_ref(idx)?));
        }
        out.push(values);
    }
    std::mem::forget(rows);
    Ok((out, false))
}

/// Reset a statement that is part way through its result set.
fn rewind(compiled: &mut CompiledStatement) {
    compiled.with_dependent_mut(|_, stmt| drop(stmt.raw_query()));
}

fn drain(stmt: &mut rusqlite::Statement<'_>) -> Result<(), SqlLeaseError> {
    let mut rows = stmt.raw_query();
    while rows.next()?.is_some() {}
    Ok(())
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(str::to_string).collect()
}

impl fmt::Debug for SqliteStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStatement")
            .field("id", &self.id)
            .field("sql", &self.sql)
            .field("finalized", &self.finalized)
            .finish()
    }
}
