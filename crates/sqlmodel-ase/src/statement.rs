//! Prepared (dynamic) statements.

#![allow(clippy::result_large_err)] // Error type is defined in sqlmodel-core

use std::sync::{Arc, Mutex};
use std::time::Instant;

use sqlmodel_core::{Error, Result, Value};

use crate::connection::{self, Session};
use crate::library::DataFormat;
use crate::result::ExecResult;
use crate::rows::RowCursor;
use crate::status::Stage;
use crate::types;

/// A statement prepared on the server under a `dyn<n>` name.
///
/// Executing it while a [`RowCursor`] from an earlier query is alive is
/// prevented by the cursor's borrow.
pub struct AseStatement {
    session: Arc<Mutex<Session>>,
    id: u64,
    name: String,
    sql: String,
    closed: bool,
}

impl std::fmt::Debug for AseStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AseStatement")
            .field("name", &self.name)
            .field("sql", &self.sql)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn bind_all(params: &[Value]) -> Result<Vec<(DataFormat, Option<Vec<u8>>)>> {
    params.iter().map(types::encode_param).collect()
}

impl AseStatement {
    pub(crate) fn new(session: Arc<Mutex<Session>>, id: u64, name: String, sql: String) -> Self {
        Self {
            session,
            id,
            name,
            sql,
            closed: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    /// Server-side name, `dyn<n>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Always -1: the parameter count is not known to the driver.
    pub fn num_input(&self) -> i32 {
        -1
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed {
            return Err(Error::statement_closed(Some(&self.sql)));
        }
        Ok(())
    }

    /// Execute a statement that returns no rows.
    pub fn exec(&mut self, params: &[Value]) -> Result<ExecResult> {
        self.exec_inner(params, None)
    }

    /// [`exec`](Self::exec) bounded by `deadline`.
    pub fn exec_with_deadline(&mut self, params: &[Value], deadline: Instant) -> Result<ExecResult> {
        self.exec_inner(params, Some(deadline))
    }

    #[tracing::instrument(level = "debug", skip(self, params), fields(statement = %self.name))]
    fn exec_inner(&mut self, params: &[Value], deadline: Option<Instant>) -> Result<ExecResult> {
        self.ensure_usable()?;
        let bound = bind_all(params)?;
        let rows = connection::lock(&self.session).execute(self.id, &self.sql, &bound, deadline)?;
        tracing::trace!(rows, "statement executed");
        Ok(ExecResult::new(rows))
    }

    /// Execute a statement and read its rows through the returned cursor.
    pub fn query(&mut self, params: &[Value]) -> Result<RowCursor<'_>> {
        self.query_inner(params, None)
    }

    /// [`query`](Self::query) bounded by `deadline`. The deadline covers
    /// the whole life of the cursor.
    pub fn query_with_deadline(
        &mut self,
        params: &[Value],
        deadline: Instant,
    ) -> Result<RowCursor<'_>> {
        self.query_inner(params, Some(deadline))
    }

    #[tracing::instrument(level = "debug", skip(self, params), fields(statement = %self.name))]
    fn query_inner(&mut self, params: &[Value], deadline: Option<Instant>) -> Result<RowCursor<'_>> {
        self.ensure_usable()?;
        let bound = bind_all(params)?;
        let (cmd, first) = {
            let mut session = connection::lock(&self.session);
            let cmd = session.start(self.id, &self.sql, &bound, deadline)?;
            let mut count = 0;
            match session.advance(cmd, Stage::Execute, &mut count) {
                Ok(first) => {
                    if first.is_none() {
                        session.disarm();
                    }
                    (cmd, first)
                }
                Err(err) => {
                    session.disarm();
                    return Err(crate::status::with_sql(err, &self.sql));
                }
            }
        };
        Ok(RowCursor::new(self, cmd, first))
    }

    /// Deallocate the statement on the server. Idempotent.
    ///
    /// After the connection is closed this is a no-op: closing the connection
    /// already deallocated the statement. A failed deallocation leaves the
    /// statement open, so `close` can be called again.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut session = connection::lock(&self.session);
        if session.ensure_open().is_ok() && session.is_live(self.id) {
            session.deallocate(self.id)?;
        }
        self.closed = true;
        Ok(())
    }
}

impl Drop for AseStatement {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(statement = %self.name, error = %err, "failed to deallocate statement on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AseDriver;
    use crate::mock::{MockLibrary, MockResponse};
    use crate::status::Verb;
    use sqlmodel_core::error::QueryErrorKind;

    fn open() -> (Arc<MockLibrary>, crate::AseConnection) {
        let lib = Arc::new(MockLibrary::new());
        let conn = AseDriver::with_library(lib.clone())
            .open("user=sa password=secret")
            .unwrap();
        (lib, conn)
    }

    #[test]
    fn names_are_sequential_and_recycled() {
        let (lib, conn) = open();
        let mut a = conn.prepare_statement("SELECT 1").unwrap();
        let b = conn.prepare_statement("SELECT 2").unwrap();
        assert_eq!(a.name(), "dyn1");
        assert_eq!(b.name(), "dyn2");
        a.close().unwrap();
        let c = conn.prepare_statement("SELECT 3").unwrap();
        assert_eq!(c.name(), "dyn1");
        assert_eq!(lib.deallocations(), vec!["dyn1".to_string()]);
    }

    #[test]
    fn close_is_idempotent() {
        let (lib, conn) = open();
        let mut stmt = conn.prepare_statement("SELECT 1").unwrap();
        stmt.close().unwrap();
        stmt.close().unwrap();
        assert_eq!(lib.call_count(Verb::CmdDrop), 1);
        assert_eq!(lib.deallocations().len(), 1);
        match stmt.exec(&[]) {
            Err(Error::Query(q)) => assert_eq!(q.kind, QueryErrorKind::StatementClosed),
            other => panic!("expected statement closed, got {other:?}"),
        }
    }

    #[test]
    fn use_after_connection_close() {
        let (lib, conn) = open();
        let mut stmt = conn.prepare_statement("SELECT 1").unwrap();
        conn.disconnect().unwrap();
        assert_eq!(lib.deallocations(), vec!["dyn1".to_string()]);
        assert!(matches!(
            stmt.exec(&[]),
            Err(Error::Connection(c)) if c.kind == sqlmodel_core::error::ConnectionErrorKind::Closed
        ));
        stmt.close().unwrap();
        assert_eq!(lib.deallocations().len(), 1);
    }

    #[test]
    fn num_input_is_unknown() {
        let (_lib, conn) = open();
        let stmt = conn.prepare_statement("SELECT ?").unwrap();
        assert_eq!(stmt.num_input(), -1);
        assert_eq!(stmt.sql(), "SELECT ?");
    }

    #[test]
    fn exec_reports_server_row_count() {
        let (lib, conn) = open();
        lib.script("UPDATE t SET a = 1", vec![MockResponse::Done(Some(4))]);
        let mut stmt = conn.prepare_statement("UPDATE t SET a = 1").unwrap();
        assert_eq!(stmt.exec(&[]).unwrap().rows_affected(), 4);
        lib.script("UPDATE t SET a = 1", vec![MockResponse::Done(None)]);
        assert_eq!(stmt.exec(&[]).unwrap().rows_affected(), 0);
    }

    #[test]
    fn failed_prepare_keeps_the_connection_usable() {
        let (lib, conn) = open();
        let err = conn.prepare_statement("SELEC 1").unwrap_err();
        assert!(matches!(err, Error::Query(_)), "{err:?}");
        assert_eq!(lib.live_commands(), 0);
        let stmt = conn.prepare_statement("SELECT 1").unwrap();
        assert_eq!(stmt.name(), "dyn1");
    }

    #[test]
    fn unsupported_parameter_is_rejected_before_sending() {
        let (lib, conn) = open();
        let mut stmt = conn.prepare_statement("SELECT ?").unwrap();
        let sends = lib.call_count(Verb::Send);
        let err = stmt.exec(&[Value::Array(vec![Value::Int(1)])]).unwrap_err();
        assert!(err.to_string().contains("unsupported parameter type"), "{err}");
        assert_eq!(lib.call_count(Verb::Send), sends);
    }
}
