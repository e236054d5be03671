//! Forward-only cursor over the results of one statement execution.

#![allow(clippy::result_large_err)] // Error type is defined in sqlmodel-core

use std::sync::Arc;

use sqlmodel_core::error::{QueryError, QueryErrorKind};
use sqlmodel_core::{ColumnInfo, Error, Result, Row};

use crate::connection;
use crate::library::{CancelKind, ColumnBuffer, DataFormat, RawCommand, ResultType};
use crate::statement::AseStatement;
use crate::status::{self, RetCode, Stage, Verb};
use crate::types::{self, ScanType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// A result set is current and has not been described yet.
    Ready(ResultType),
    Fetching,
    /// The current set returned its last row.
    Exhausted,
    /// The current set is exhausted and the next one is already current.
    Lookahead(ResultType),
    /// Every result was consumed.
    Done,
    Closed,
}

#[derive(Debug, Default)]
struct Metadata {
    formats: Vec<DataFormat>,
    columns: Arc<ColumnInfo>,
    buffers: Vec<ColumnBuffer>,
}

/// Rows of one execution, read lazily.
///
/// Column metadata is discovered at the first fetch of each result set;
/// until then the metadata accessors answer `None` or an empty list.
/// Dropping the cursor cancels unread rows.
pub struct RowCursor<'stmt> {
    stmt: &'stmt mut AseStatement,
    cmd: RawCommand,
    phase: Phase,
    metadata: Option<Metadata>,
    pending_row: Option<Row>,
}

impl std::fmt::Debug for RowCursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCursor")
            .field("statement", &self.stmt.name())
            .field("phase", &self.phase)
            .field("columns", &self.columns())
            .finish_non_exhaustive()
    }
}

impl<'stmt> RowCursor<'stmt> {
    pub(crate) fn new(
        stmt: &'stmt mut AseStatement,
        cmd: RawCommand,
        first: Option<ResultType>,
    ) -> Self {
        Self {
            stmt,
            cmd,
            phase: first.map_or(Phase::Done, Phase::Ready),
            metadata: None,
            pending_row: None,
        }
    }

    /// Put the cursor in a terminal phase and clear the network timeout.
    fn finish(&mut self, phase: Phase) {
        self.phase = phase;
        self.pending_row = None;
        connection::lock(self.stmt.session()).disarm();
    }

    /// Cancel every pending result after an error.
    fn abort(&mut self, err: Error) -> Error {
        connection::lock(self.stmt.session()).cancel_quietly(self.cmd, CancelKind::All);
        self.finish(Phase::Done);
        status::with_sql(err, self.stmt.sql())
    }

    fn describe(&mut self) -> Result<()> {
        let session = connection::lock(self.stmt.session());
        let formats = session.describe(self.cmd)?;
        let text_limit = session.text_limit;
        drop(session);

        let names = formats
            .iter()
            .enumerate()
            .map(|(i, f)| {
                if f.name.is_empty() {
                    format!("column{}", i + 1)
                } else {
                    f.name.clone()
                }
            })
            .collect();
        let buffers = formats
            .iter()
            .map(|f| ColumnBuffer::new(f.clone(), types::buffer_capacity(f, text_limit)))
            .collect();
        tracing::trace!(columns = formats.len(), "described result set");
        self.metadata = Some(Metadata {
            formats,
            columns: Arc::new(ColumnInfo::new(names)),
            buffers,
        });
        Ok(())
    }

    fn fetch(&mut self) -> Result<Option<Row>> {
        let Some(meta) = self.metadata.as_mut() else {
            return Ok(None);
        };
        let session = connection::lock(self.stmt.session());
        let rc = session.fetch(self.cmd, &mut meta.buffers);
        match rc {
            RetCode::SUCCEED => {
                drop(session);
                let values = meta
                    .buffers
                    .iter()
                    .map(types::decode_buffer)
                    .collect::<Result<Vec<_>>>()?;
                Ok(Some(Row::with_columns(Arc::clone(&meta.columns), values)))
            }
            RetCode::END_DATA => Ok(None),
            RetCode::ROW_FAIL => {
                let err = session.fail(rc, Verb::Fetch, Stage::Fetch);
                drop(session);
                // A positive indicator holds the untruncated length.
                Err(match meta.buffers.iter().find(|b| b.indicator > 0) {
                    Some(b) => Error::Query(QueryError::new(
                        QueryErrorKind::Fetch,
                        format!(
                            "ct_fetch failed: column '{}' truncated ({} bytes, buffer holds {})",
                            b.format.name,
                            b.indicator,
                            b.data.len()
                        ),
                    )),
                    None => err,
                })
            }
            RetCode::TIMED_OUT => {
                session.cancel_quietly(self.cmd, CancelKind::Attention);
                session.discard_messages();
                tracing::debug!("fetch timed out; sent attention");
                Err(Error::Timeout)
            }
            other => Err(session.fail(other, Verb::Fetch, Stage::Fetch)),
        }
    }

    /// Read the next row of the current result set.
    pub fn next_row(&mut self) -> Result<Option<Row>> {
        if let Some(row) = self.pending_row.take() {
            return Ok(Some(row));
        }
        if let Phase::Ready(_) = self.phase {
            if let Err(err) = self.describe() {
                return Err(self.abort(err));
            }
            self.phase = Phase::Fetching;
        }
        if self.phase != Phase::Fetching {
            return Ok(None);
        }
        match self.fetch() {
            Ok(Some(row)) => Ok(Some(row)),
            Ok(None) => {
                self.phase = Phase::Exhausted;
                Ok(None)
            }
            // The attention already discarded the pending results.
            Err(Error::Timeout) => {
                self.finish(Phase::Done);
                Err(Error::Timeout)
            }
            Err(err) => Err(self.abort(err)),
        }
    }

    /// Move the command to its next result set, skipping unread rows.
    fn advance(&mut self) -> Result<Option<ResultType>> {
        let mut count = 0;
        let next = connection::lock(self.stmt.session()).advance(self.cmd, Stage::Fetch, &mut count);
        match next {
            Ok(Some(rt)) => Ok(Some(rt)),
            Ok(None) => {
                self.finish(Phase::Done);
                Ok(None)
            }
            Err(err) => {
                self.finish(Phase::Done);
                Err(status::with_sql(err, self.stmt.sql()))
            }
        }
    }

    fn skip_current(&mut self) -> Result<()> {
        self.pending_row = None;
        let cancelled =
            connection::lock(self.stmt.session()).cancel(self.cmd, CancelKind::Current, Stage::Fetch);
        cancelled.map_err(|err| self.abort(err))
    }

    /// Whether another result set follows the current one.
    ///
    /// Stays true until the command reports that every result was returned.
    /// While rows of the current set remain unread, one row is read ahead to
    /// find out whether the set is finished.
    pub fn has_next_result_set(&mut self) -> Result<bool> {
        if self.phase == Phase::Fetching && self.pending_row.is_none() {
            if let Some(row) = self.next_row()? {
                self.pending_row = Some(row);
            }
        }
        match self.phase {
            Phase::Ready(_) | Phase::Lookahead(_) | Phase::Fetching => Ok(true),
            Phase::Exhausted => match self.advance()? {
                Some(rt) => {
                    self.phase = Phase::Lookahead(rt);
                    Ok(true)
                }
                None => Ok(false),
            },
            Phase::Done | Phase::Closed => Ok(false),
        }
    }

    /// Skip the rest of the current result set and make the next one
    /// current. Returns false when no result set is left.
    pub fn next_result_set(&mut self) -> Result<bool> {
        let next = match self.phase {
            Phase::Lookahead(rt) => Some(rt),
            Phase::Ready(_) | Phase::Fetching => {
                self.skip_current()?;
                self.advance()?
            }
            Phase::Exhausted => self.advance()?,
            Phase::Done | Phase::Closed => None,
        };
        match next {
            Some(rt) => {
                self.phase = Phase::Ready(rt);
                self.metadata = None;
                self.pending_row = None;
                tracing::trace!(result = ?rt, "moved to next result set");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel unread rows and release the command. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        match self.phase {
            Phase::Closed => return Ok(()),
            Phase::Done => {
                self.phase = Phase::Closed;
                return Ok(());
            }
            _ => {}
        }
        let cancelled = {
            let session = connection::lock(self.stmt.session());
            if session.ensure_open().is_err() {
                Ok(())
            } else {
                session.cancel(self.cmd, CancelKind::All, Stage::Fetch)
            }
        };
        self.finish(Phase::Closed);
        self.metadata = None;
        cancelled
    }

    // ---------- metadata ----------

    fn format(&self, index: usize) -> Option<&DataFormat> {
        self.metadata.as_ref()?.formats.get(index)
    }

    /// Column names of the current result set.
    pub fn columns(&self) -> Vec<String> {
        self.metadata
            .as_ref()
            .map(|m| m.columns.names().to_vec())
            .unwrap_or_default()
    }

    /// Server type name of column `index`, e.g. `NUMERIC`.
    pub fn column_database_type_name(&self, index: usize) -> Option<&'static str> {
        self.format(index).map(|f| f.datatype.sql_name())
    }

    /// Whether column `index` may hold NULL. `None` before the first fetch.
    pub fn column_nullable(&self, index: usize) -> Option<bool> {
        self.format(index).map(DataFormat::is_nullable)
    }

    pub fn column_precision_scale(&self, index: usize) -> Option<(i64, i64)> {
        self.format(index).and_then(types::precision_scale)
    }

    /// Declared length of character and binary columns.
    pub fn column_length(&self, index: usize) -> Option<i64> {
        self.format(index)
            .filter(|f| f.datatype.is_variable_length())
            .map(|f| i64::from(f.maxlength))
    }

    pub fn column_scan_type(&self, index: usize) -> Option<ScanType> {
        self.format(index).and_then(|f| f.datatype.scan_type())
    }
}

impl Iterator for RowCursor<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for RowCursor<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to cancel pending rows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AseDriver;
    use crate::mock::{MockLibrary, MockResponse, MockRows};
    use crate::types::DbType;
    use sqlmodel_core::Value;

    fn open() -> (Arc<MockLibrary>, crate::AseConnection) {
        let lib = Arc::new(MockLibrary::new());
        let conn = AseDriver::with_library(lib.clone())
            .open("user=sa password=secret")
            .unwrap();
        (lib, conn)
    }

    fn two_sets(lib: &MockLibrary) {
        lib.script(
            "exec sp_two",
            vec![
                MockResponse::Rows(
                    MockRows::new()
                        .column("a", DbType::Int)
                        .row(vec![Value::Int(1)])
                        .row(vec![Value::Int(2)]),
                ),
                MockResponse::Rows(
                    MockRows::new()
                        .column("b", DbType::VarChar)
                        .row(vec![Value::Text("x".into())]),
                ),
                MockResponse::Done(None),
            ],
        );
    }

    #[test]
    fn metadata_is_empty_before_first_fetch() {
        let (_lib, conn) = open();
        let mut stmt = conn.prepare_statement("SELECT 1").unwrap();
        let mut cursor = stmt.query(&[]).unwrap();
        assert!(cursor.columns().is_empty());
        assert_eq!(cursor.column_nullable(0), None);
        assert_eq!(cursor.column_database_type_name(0), None);

        let row = cursor.next_row().unwrap().unwrap();
        assert_eq!(row.get_as::<i64>(0).unwrap(), 1);
        assert_eq!(cursor.columns().len(), 1);
        assert_eq!(cursor.column_scan_type(0), Some(ScanType::Int64));
        assert!(cursor.next_row().unwrap().is_none());
        assert!(!cursor.has_next_result_set().unwrap());
    }

    #[test]
    fn walks_multiple_result_sets() {
        let (lib, conn) = open();
        two_sets(&lib);
        let mut stmt = conn.prepare_statement("exec sp_two").unwrap();
        let mut cursor = stmt.query(&[]).unwrap();

        let first: Vec<Row> = cursor.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(first.len(), 2);
        assert!(cursor.has_next_result_set().unwrap());
        assert_eq!(cursor.columns(), vec!["a".to_string()]);

        assert!(cursor.next_result_set().unwrap());
        assert!(cursor.columns().is_empty());
        let row = cursor.next_row().unwrap().unwrap();
        assert_eq!(row.get_named::<String>("b").unwrap(), "x");
        assert_eq!(cursor.column_database_type_name(0), Some("VARCHAR"));
        assert!(cursor.next_row().unwrap().is_none());
        assert!(!cursor.has_next_result_set().unwrap());
        assert!(!cursor.next_result_set().unwrap());
    }

    #[test]
    fn next_result_set_skips_unread_rows() {
        let (lib, conn) = open();
        two_sets(&lib);
        let mut stmt = conn.prepare_statement("exec sp_two").unwrap();
        let mut cursor = stmt.query(&[]).unwrap();
        assert!(cursor.next_result_set().unwrap());
        let row = cursor.next_row().unwrap().unwrap();
        assert_eq!(row.get_as::<String>(0).unwrap(), "x");
    }

    #[test]
    fn has_next_reads_ahead_without_losing_rows() {
        let (lib, conn) = open();
        two_sets(&lib);
        let mut stmt = conn.prepare_statement("exec sp_two").unwrap();
        let mut cursor = stmt.query(&[]).unwrap();
        cursor.next_row().unwrap().unwrap();
        assert!(cursor.has_next_result_set().unwrap());
        let second = cursor.next_row().unwrap().unwrap();
        assert_eq!(second.get_as::<i64>(0).unwrap(), 2);
    }

    #[test]
    fn close_cancels_pending_rows() {
        let (lib, conn) = open();
        two_sets(&lib);
        let mut stmt = conn.prepare_statement("exec sp_two").unwrap();
        let mut cursor = stmt.query(&[]).unwrap();
        cursor.next_row().unwrap();
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(cursor.next_row().unwrap().is_none());
        drop(cursor);
        // The command is idle again.
        assert_eq!(stmt.query(&[]).unwrap().count(), 2);
    }

    #[test]
    fn truncated_column_fails_the_fetch() {
        let lib = Arc::new(MockLibrary::new());
        lib.script(
            "SELECT body FROM notes",
            vec![
                MockResponse::Rows(
                    MockRows::new()
                        .format(DataFormat::new(DbType::Text, 64).named("body"))
                        .row(vec![Value::Text("x".repeat(64))]),
                ),
                MockResponse::Done(Some(1)),
            ],
        );
        let config = crate::AseConfig::from_dsn("user=sa password=x")
            .unwrap()
            .text_limit(16);
        let conn = AseDriver::with_library(lib.clone()).connect(&config).unwrap();
        let mut stmt = conn.prepare_statement("SELECT body FROM notes").unwrap();
        let mut cursor = stmt.query(&[]).unwrap();
        let err = cursor.next_row().unwrap_err();
        assert!(err.to_string().contains("column 'body' truncated"), "{err}");
        assert!(cursor.next_row().unwrap().is_none());
        drop(cursor);
        assert_eq!(stmt.exec(&[]).unwrap().rows_affected(), 1);
    }
}
