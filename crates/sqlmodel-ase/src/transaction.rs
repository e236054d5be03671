//! Transactions on an [`AseConnection`].
//!
//! ```ignore
//! let tx = conn.begin_transaction()?;
//! conn.execute_raw("UPDATE accounts SET balance = balance - 10 WHERE id = 1")?;
//! tx.save("before_credit")?;
//! conn.execute_raw("UPDATE accounts SET balance = balance + 10 WHERE id = 2")?;
//! tx.commit_sync()?;
//! ```

#![allow(clippy::result_large_err)] // Error type is defined in sqlmodel-core

use std::sync::{Mutex, PoisonError};

use sqlmodel_core::error::{TransactionError, TransactionErrorKind};
use sqlmodel_core::{Cx, Error, Outcome, Result, Row, TransactionOps, Value};

use crate::connection::{self, AseConnection, TxState};

/// An active transaction. Dropping it without committing rolls it back.
///
/// `BEGIN TRANSACTION` is sent with the first statement run on the
/// connection after [`AseConnection::begin_transaction`]; a transaction in
/// which nothing ran commits and rolls back without a server round trip.
pub struct AseTransaction<'conn> {
    conn: &'conn AseConnection,
    finished: bool,
    savepoints: Mutex<Vec<String>>,
}

impl std::fmt::Debug for AseTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AseTransaction")
            .field("finished", &self.finished)
            .field("savepoints", &self.savepoints())
            .finish_non_exhaustive()
    }
}

fn check_savepoint(name: &str) -> Result<()> {
    if connection::is_identifier(name) {
        Ok(())
    } else {
        Err(Error::Custom(format!("invalid savepoint name '{name}'")))
    }
}

impl<'conn> AseTransaction<'conn> {
    pub(crate) fn new(conn: &'conn AseConnection) -> Self {
        Self {
            conn,
            finished: false,
            savepoints: Mutex::new(Vec::new()),
        }
    }

    /// The connection the transaction runs on.
    pub fn connection(&self) -> &'conn AseConnection {
        self.conn
    }

    /// Savepoints created so far, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.savepoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send `sql` if the server-side transaction started, then free the slot.
    fn finish(&mut self, sql: &str) -> Result<()> {
        self.finished = true;
        let mut session = connection::lock(self.conn.session());
        let started = session.tx == TxState::Started;
        session.tx = TxState::None;
        if !started {
            tracing::debug!(sql, "transaction ended before anything ran");
            return Ok(());
        }
        session.transaction_command(sql)
    }

    pub fn commit_sync(mut self) -> Result<()> {
        self.finish("COMMIT TRANSACTION")
    }

    pub fn rollback_sync(mut self) -> Result<()> {
        self.finish("ROLLBACK TRANSACTION")
    }

    /// `SAVE TRANSACTION name`. Starts the server-side transaction if needed.
    pub fn save(&self, name: &str) -> Result<()> {
        check_savepoint(name)?;
        connection::lock(self.conn.session()).execute_language(&format!("SAVE TRANSACTION {name}"))?;
        self.savepoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
        Ok(())
    }

    /// `ROLLBACK TRANSACTION name`; savepoints made after `name` are
    /// discarded.
    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        let mut savepoints = self.savepoints.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = savepoints.iter().rposition(|s| s == name) else {
            return Err(savepoint_not_found(name));
        };
        connection::lock(self.conn.session())
            .transaction_command(&format!("ROLLBACK TRANSACTION {name}"))?;
        savepoints.truncate(pos + 1);
        Ok(())
    }

    /// Forget savepoint `name`. ASE has no release statement, so nothing is
    /// sent.
    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        let mut savepoints = self.savepoints.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = savepoints.iter().rposition(|s| s == name) else {
            return Err(savepoint_not_found(name));
        };
        savepoints.remove(pos);
        Ok(())
    }
}

fn savepoint_not_found(name: &str) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::SavepointNotFound,
        message: format!("savepoint '{name}' does not exist"),
    })
}

impl Drop for AseTransaction<'_> {
    fn drop(&mut self) {
        if self.finished || self.conn.is_closed() {
            return;
        }
        if let Err(err) = self.finish("ROLLBACK TRANSACTION") {
            tracing::warn!(error = %err, "failed to roll back dropped transaction");
        }
    }
}

fn cancelled<T>(cx: &Cx) -> Option<Outcome<T, Error>> {
    cx.cancel_reason().map(Outcome::Cancelled)
}

impl TransactionOps for AseTransaction<'_> {
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.conn
                .query_sync(sql, params)
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.conn
                .query_sync(sql, params)
                .map(|rows| rows.into_iter().next())
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.conn
                .execute_sync(sql, params)
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result =
            cancelled(cx).unwrap_or_else(|| self.save(name).map_or_else(Outcome::Err, Outcome::Ok));
        async move { result }
    }

    fn rollback_to(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.rollback_to_savepoint(name)
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn release(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.release_savepoint(name)
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    async fn commit(self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        self.commit_sync().map_or_else(Outcome::Err, Outcome::Ok)
    }

    async fn rollback(self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        self.rollback_sync().map_or_else(Outcome::Err, Outcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::AseDriver;
    use crate::mock::MockLibrary;
    use sqlmodel_core::IsolationLevel;
    use std::sync::Arc;

    fn open() -> (Arc<MockLibrary>, AseConnection) {
        let lib = Arc::new(MockLibrary::new());
        let conn = AseDriver::with_library(lib.clone())
            .open("user=sa password=secret")
            .unwrap();
        conn.execute_raw("CREATE TABLE t (a int NULL)").unwrap();
        (lib, conn)
    }

    fn sent(lib: &MockLibrary) -> Vec<String> {
        lib.language_commands()
            .into_iter()
            .filter(|s| !s.starts_with("CREATE"))
            .collect()
    }

    #[test]
    fn begin_is_sent_with_the_first_statement() {
        let (lib, conn) = open();
        let tx = conn.begin_transaction().unwrap();
        assert!(sent(&lib).is_empty());
        conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
        tx.commit_sync().unwrap();
        assert_eq!(
            sent(&lib),
            vec![
                "BEGIN TRANSACTION".to_string(),
                "INSERT INTO t VALUES (1)".to_string(),
                "COMMIT TRANSACTION".to_string(),
            ]
        );
        assert_eq!(lib.row_count("t"), Some(1));
    }

    #[test]
    fn empty_transaction_sends_nothing() {
        let (lib, conn) = open();
        conn.begin_transaction().unwrap().commit_sync().unwrap();
        conn.begin_transaction().unwrap().rollback_sync().unwrap();
        assert!(sent(&lib).is_empty());
    }

    #[test]
    fn isolation_level_precedes_begin() {
        let (lib, conn) = open();
        let tx = conn
            .begin_transaction_with(IsolationLevel::Serializable)
            .unwrap();
        conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
        tx.rollback_sync().unwrap();
        assert_eq!(sent(&lib)[0], "SET TRANSACTION ISOLATION LEVEL 3");
        assert_eq!(sent(&lib)[1], "BEGIN TRANSACTION");
        assert_eq!(lib.row_count("t"), Some(0));
    }

    #[test]
    fn one_transaction_per_connection() {
        let (_lib, conn) = open();
        let tx = conn.begin_transaction().unwrap();
        match conn.begin_transaction() {
            Err(Error::Transaction(t)) => assert_eq!(t.kind, TransactionErrorKind::AlreadyActive),
            other => panic!("expected AlreadyActive, got {other:?}"),
        }
        tx.commit_sync().unwrap();
        conn.begin_transaction().unwrap().commit_sync().unwrap();
    }

    #[test]
    fn drop_rolls_back() {
        let (lib, conn) = open();
        {
            let _tx = conn.begin_transaction().unwrap();
            conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
        }
        assert_eq!(lib.row_count("t"), Some(0));
        assert_eq!(sent(&lib).last().map(String::as_str), Some("ROLLBACK TRANSACTION"));
        conn.begin_transaction().unwrap().commit_sync().unwrap();
    }

    #[test]
    fn savepoints() {
        let (lib, conn) = open();
        let tx = conn.begin_transaction().unwrap();
        conn.execute_raw("INSERT INTO t VALUES (1)").unwrap();
        tx.save("sp1").unwrap();
        conn.execute_raw("INSERT INTO t VALUES (2)").unwrap();
        tx.save("sp2").unwrap();
        tx.rollback_to_savepoint("sp1").unwrap();
        assert_eq!(tx.savepoints(), vec!["sp1".to_string()]);
        assert_eq!(lib.row_count("t"), Some(1));

        assert!(matches!(
            tx.rollback_to_savepoint("sp2"),
            Err(Error::Transaction(t)) if t.kind == TransactionErrorKind::SavepointNotFound
        ));
        tx.release_savepoint("sp1").unwrap();
        assert!(tx.savepoints().is_empty());
        assert!(tx.save("bad name").is_err());
        tx.commit_sync().unwrap();
        assert_eq!(lib.row_count("t"), Some(1));
    }
}
