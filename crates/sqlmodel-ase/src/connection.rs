//! ASE connection implementation.
//!
//! An [`AseConnection`] owns one CT-Library connection handle. The handle and
//! the command handles of every statement prepared on it live in a
//! [`Session`] behind a mutex shared with those statements, so closing the
//! connection can deallocate statements that are still alive, and a
//! statement used after its connection closed reports "connection closed".
//!
//! Transactions are started lazily: [`AseConnection::begin_transaction`]
//! only records a pending transaction, and the next statement executed on
//! the connection sends `BEGIN TRANSACTION` first.

#![allow(clippy::result_large_err)] // Error type is defined in sqlmodel-core

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CString;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sqlmodel_core::error::{QueryError, QueryErrorKind, TransactionError, TransactionErrorKind};
use sqlmodel_core::{
    Connection, Cx, Driver, Error, IsolationLevel, Outcome, PreparedStatement, Row, Value,
};

use crate::config::AseConfig;
use crate::context::ContextManager;
use crate::library::{
    CancelKind, CancelTarget, ClientLibrary, CloseOption, ColumnBuffer, ConProperty, DataFormat,
    DynamicOp, RawCommand, RawConnection, ResInfo, ResultType,
};
use crate::statement::AseStatement;
use crate::status::{self, Diagnostic, RetCode, Stage, Verb};
use crate::transaction::AseTransaction;

/// Name the driver registers under.
pub const DRIVER_NAME: &str = "ase";

/// Encoded statement parameters, in order.
pub(crate) type Params = [(DataFormat, Option<Vec<u8>>)];

// ==================== Session ====================

/// Server-side statement names, `dyn1`, `dyn2`, ... The smallest released
/// number is reused first.
#[derive(Debug, Default)]
struct NameAllocator {
    next: u64,
    free: BTreeSet<u64>,
}

impl NameAllocator {
    fn allocate(&mut self) -> u64 {
        self.free.pop_first().unwrap_or_else(|| {
            self.next += 1;
            self.next
        })
    }

    fn release(&mut self, number: u64) {
        self.free.insert(number);
    }
}

fn statement_name(number: u64) -> String {
    format!("dyn{number}")
}

#[derive(Debug)]
struct LiveStatement {
    number: u64,
    name: String,
    cmd: RawCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxState {
    None,
    /// `begin` was called; nothing was sent yet.
    Pending(Option<IsolationLevel>),
    /// `BEGIN TRANSACTION` was sent.
    Started,
}

/// Native state of one connection.
pub(crate) struct Session {
    lib: Arc<dyn ClientLibrary>,
    context: Arc<ContextManager>,
    con: RawConnection,
    open: bool,
    names: NameAllocator,
    statements: BTreeMap<u64, LiveStatement>,
    next_id: u64,
    pub(crate) tx: TxState,
    timeout_armed: bool,
    query_timeout: Option<Duration>,
    pub(crate) text_limit: usize,
}

pub(crate) fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn c_string(text: &str, what: &str) -> Result<CString, Error> {
    CString::new(text).map_err(|_| {
        Error::Query(
            QueryError::new(
                QueryErrorKind::Syntax,
                format!("{what} contains a NUL byte"),
            )
            .with_sql(text),
        )
    })
}

/// Whole seconds left before `deadline`, rounded up and at least one.
pub(crate) fn timeout_seconds(deadline: Instant, now: Instant) -> Result<i32, Error> {
    let remaining = deadline.saturating_duration_since(now);
    if remaining.is_zero() {
        return Err(Error::Timeout);
    }
    Ok(duration_seconds(remaining))
}

fn duration_seconds(duration: Duration) -> i32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i32::try_from(secs.max(1)).unwrap_or(i32::MAX)
}

impl Session {
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.open {
            Ok(())
        } else {
            Err(Error::connection_closed())
        }
    }

    fn messages(&self) -> Vec<Diagnostic> {
        self.lib.take_messages(self.con)
    }

    /// Drop diagnostics left over from earlier calls.
    pub(crate) fn discard_messages(&self) {
        for diag in self.messages() {
            tracing::trace!(number = diag.number, severity = diag.severity, message = %diag, "server message");
        }
    }

    pub(crate) fn fail(&self, rc: RetCode, verb: Verb, stage: Stage) -> Error {
        status::failure(rc, verb, stage, &self.messages())
    }

    pub(crate) fn check(&self, rc: RetCode, verb: Verb, stage: Stage) -> Result<(), Error> {
        if rc.is_succeed() {
            Ok(())
        } else {
            Err(self.fail(rc, verb, stage))
        }
    }

    pub(crate) fn cancel(&self, cmd: RawCommand, kind: CancelKind, stage: Stage) -> Result<(), Error> {
        let rc = self.lib.ct_cancel(CancelTarget::Command(cmd), kind);
        self.check(rc, Verb::Cancel, stage)
    }

    pub(crate) fn cancel_quietly(&self, cmd: RawCommand, kind: CancelKind) {
        let rc = self.lib.ct_cancel(CancelTarget::Command(cmd), kind);
        if !rc.is_succeed() {
            tracing::warn!(status = %rc, ?kind, "ct_cancel failed");
        }
    }

    /// The command of live statement `id`.
    pub(crate) fn command(&self, id: u64, sql: &str) -> Result<RawCommand, Error> {
        self.ensure_open()?;
        self.statements
            .get(&id)
            .map(|s| s.cmd)
            .ok_or_else(|| Error::statement_closed(Some(sql)))
    }

    pub(crate) fn is_live(&self, id: u64) -> bool {
        self.statements.contains_key(&id)
    }

    // ---------- timeouts ----------

    /// Seconds to arm for a call; no native call is made here.
    fn timeout_for(&self, deadline: Option<Instant>) -> Result<Option<i32>, Error> {
        match deadline {
            Some(deadline) => timeout_seconds(deadline, Instant::now()).map(Some),
            None => Ok(self
                .query_timeout
                .filter(|d| !d.is_zero())
                .map(duration_seconds)),
        }
    }

    fn arm(&mut self, seconds: Option<i32>) -> Result<(), Error> {
        let Some(seconds) = seconds else {
            return Ok(());
        };
        let rc = self.lib.ct_timeout(self.con, Some(seconds));
        self.check(rc, Verb::Timeout, Stage::Execute)?;
        self.timeout_armed = true;
        tracing::trace!(seconds, "armed network timeout");
        Ok(())
    }

    pub(crate) fn disarm(&mut self) {
        if !self.timeout_armed || !self.open {
            return;
        }
        let rc = self.lib.ct_timeout(self.con, None);
        if rc.is_succeed() {
            self.timeout_armed = false;
        } else {
            tracing::warn!(status = %rc, "failed to clear network timeout");
        }
    }

    // ---------- results ----------

    /// Process results up to the next one carrying rows.
    ///
    /// Row counts of completed commands are added to `count`. A failed
    /// command does not stop processing; its error is returned once the
    /// results are drained. `Ok(None)` means every result was consumed.
    pub(crate) fn advance(
        &mut self,
        cmd: RawCommand,
        stage: Stage,
        count: &mut u64,
    ) -> Result<Option<ResultType>, Error> {
        let mut failed: Option<Error> = None;
        loop {
            match self.lib.ct_results(cmd) {
                Ok(rt) if rt.has_rows() => {
                    if let Some(err) = failed {
                        self.cancel_quietly(cmd, CancelKind::All);
                        return Err(err);
                    }
                    tracing::trace!(result = ?rt, "result set ready");
                    return Ok(Some(rt));
                }
                Ok(ResultType::CmdDone) => {
                    let rows = self
                        .lib
                        .ct_res_info(cmd, ResInfo::RowCount)
                        .ok()
                        .and_then(|n| u64::try_from(n).ok());
                    if let Some(rows) = rows {
                        *count += rows;
                    }
                }
                Ok(ResultType::CmdFail) => {
                    if failed.is_none() {
                        failed = Some(status::command_failed(stage, &self.messages()));
                    }
                }
                Ok(rt) => tracing::trace!(result = ?rt, "skipping result"),
                Err(RetCode::END_RESULTS) => return failed.map_or(Ok(None), Err),
                Err(RetCode::TIMED_OUT) => {
                    self.cancel_quietly(cmd, CancelKind::Attention);
                    self.discard_messages();
                    tracing::debug!("command timed out; sent attention");
                    return Err(Error::Timeout);
                }
                Err(rc) => {
                    let err = self.fail(rc, Verb::Results, stage);
                    self.cancel_quietly(cmd, CancelKind::All);
                    return Err(err);
                }
            }
        }
    }

    /// Process every result, discarding rows, and return the summed row count.
    pub(crate) fn drain(&mut self, cmd: RawCommand, stage: Stage) -> Result<u64, Error> {
        let mut count = 0;
        while self.advance(cmd, stage, &mut count)?.is_some() {
            if let Err(err) = self.cancel(cmd, CancelKind::Current, stage) {
                self.cancel_quietly(cmd, CancelKind::All);
                return Err(err);
            }
        }
        Ok(count)
    }

    /// Describe the columns of the current result set.
    pub(crate) fn describe(&self, cmd: RawCommand) -> Result<Vec<DataFormat>, Error> {
        let count = self
            .lib
            .ct_res_info(cmd, ResInfo::NumData)
            .map_err(|rc| self.fail(rc, Verb::ResInfo, Stage::Fetch))?;
        (1..=count)
            .map(|item| {
                self.lib
                    .ct_describe(cmd, item)
                    .map_err(|rc| self.fail(rc, Verb::Describe, Stage::Fetch))
            })
            .collect()
    }

    pub(crate) fn fetch(&self, cmd: RawCommand, buffers: &mut [ColumnBuffer]) -> RetCode {
        self.lib.ct_fetch(cmd, buffers)
    }

    // ---------- language commands ----------

    fn run_language(&mut self, sql: &str, stage: Stage) -> Result<u64, Error> {
        let text = c_string(sql, "SQL text")?;
        self.discard_messages();
        let cmd = self
            .lib
            .ct_cmd_alloc(self.con)
            .map_err(|rc| self.fail(rc, Verb::CmdAlloc, stage))?;

        let result = self.language_on(cmd, &text, stage);
        let dropped = self.lib.ct_cmd_drop(cmd);
        let result = match result {
            Ok(count) => self.check(dropped, Verb::CmdDrop, stage).map(|()| count),
            Err(err) => {
                if !dropped.is_succeed() {
                    tracing::warn!(status = %dropped, "ct_cmd_drop failed after command error");
                }
                Err(err)
            }
        };
        tracing::trace!(sql, ok = result.is_ok(), "language command");
        result.map_err(|e| status::with_sql(e, sql))
    }

    fn language_on(&mut self, cmd: RawCommand, text: &CString, stage: Stage) -> Result<u64, Error> {
        self.check(self.lib.ct_command(cmd, text), Verb::Command, stage)?;
        let sent = self.lib.ct_send(cmd);
        if !sent.is_succeed() {
            let err = self.fail(sent, Verb::Send, stage);
            self.cancel_quietly(cmd, CancelKind::All);
            return Err(err);
        }
        self.drain(cmd, stage)
    }

    /// Send `BEGIN TRANSACTION` for a pending transaction.
    fn begin_pending(&mut self) -> Result<(), Error> {
        let TxState::Pending(isolation) = self.tx else {
            return Ok(());
        };
        if let Some(level) = isolation {
            let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", level.level());
            self.run_language(&sql, Stage::Transaction)?;
        }
        self.run_language("BEGIN TRANSACTION", Stage::Transaction)?;
        self.tx = TxState::Started;
        tracing::debug!(?isolation, "began transaction");
        Ok(())
    }

    /// Run a language command inside the pending transaction, if any.
    pub(crate) fn execute_language(&mut self, sql: &str) -> Result<u64, Error> {
        self.ensure_open()?;
        self.begin_pending()?;
        let seconds = self.timeout_for(None)?;
        self.arm(seconds)?;
        let result = self.run_language(sql, Stage::Execute);
        self.disarm();
        result
    }

    /// Run driver-issued transaction control SQL.
    pub(crate) fn transaction_command(&mut self, sql: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.run_language(sql, Stage::Transaction).map(|_| ())
    }

    // ---------- dynamic statements ----------

    /// Prepare `sql` under a fresh statement name.
    fn prepare(&mut self, sql: &str) -> Result<(u64, String), Error> {
        self.ensure_open()?;
        let text = c_string(sql, "SQL text")?;
        self.discard_messages();

        let cmd = self
            .lib
            .ct_cmd_alloc(self.con)
            .map_err(|rc| self.fail(rc, Verb::CmdAlloc, Stage::Prepare))?;
        let number = self.names.allocate();
        let name = statement_name(number);

        if let Err(err) = self.prepare_on(cmd, &name, &text) {
            let rc = self.lib.ct_cmd_drop(cmd);
            if !rc.is_succeed() {
                tracing::warn!(status = %rc, "ct_cmd_drop failed after prepare error");
            }
            // The server never registered the name.
            self.names.release(number);
            return Err(status::with_sql(err, sql));
        }

        self.next_id += 1;
        let id = self.next_id;
        self.statements.insert(
            id,
            LiveStatement {
                number,
                name: name.clone(),
                cmd,
            },
        );
        tracing::debug!(statement = %name, sql, "prepared statement");
        Ok((id, name))
    }

    fn prepare_on(&mut self, cmd: RawCommand, name: &str, text: &CString) -> Result<(), Error> {
        let c_name = c_string(name, "statement name")?;
        let rc = self
            .lib
            .ct_dynamic(cmd, DynamicOp::Prepare, &c_name, Some(text));
        self.check(rc, Verb::Dynamic, Stage::Prepare)?;
        let sent = self.lib.ct_send(cmd);
        if !sent.is_succeed() {
            let err = self.fail(sent, Verb::Send, Stage::Prepare);
            self.cancel_quietly(cmd, CancelKind::All);
            return Err(err);
        }
        self.drain(cmd, Stage::Prepare).map(|_| ())
    }

    /// Bind `params` and send an execute of statement `id`.
    ///
    /// Returns the command handle; its results are pending.
    pub(crate) fn start(
        &mut self,
        id: u64,
        sql: &str,
        params: &Params,
        deadline: Option<Instant>,
    ) -> Result<RawCommand, Error> {
        let cmd = self.command(id, sql)?;
        let seconds = self.timeout_for(deadline)?;
        self.begin_pending()?;
        self.discard_messages();
        self.arm(seconds)?;
        let name = self
            .statements
            .get(&id)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        if let Err(err) = self.send_execute(cmd, &name, params) {
            self.disarm();
            return Err(status::with_sql(err, sql));
        }
        Ok(cmd)
    }

    fn send_execute(&mut self, cmd: RawCommand, name: &str, params: &Params) -> Result<(), Error> {
        let c_name = c_string(name, "statement name")?;
        let rc = self.lib.ct_dynamic(cmd, DynamicOp::Execute, &c_name, None);
        self.check(rc, Verb::Dynamic, Stage::Execute)?;
        for (format, data) in params {
            let rc = self.lib.ct_param(cmd, format, data.as_deref());
            if !rc.is_succeed() {
                let err = self.fail(rc, Verb::Param, Stage::Execute);
                self.cancel_quietly(cmd, CancelKind::All);
                return Err(err);
            }
        }
        tracing::trace!(statement = name, params = params.len(), "bound parameters");
        let sent = self.lib.ct_send(cmd);
        if !sent.is_succeed() {
            let err = self.fail(sent, Verb::Send, Stage::Execute);
            self.cancel_quietly(cmd, CancelKind::All);
            return Err(err);
        }
        Ok(())
    }

    /// Execute statement `id` and drain its results.
    pub(crate) fn execute(
        &mut self,
        id: u64,
        sql: &str,
        params: &Params,
        deadline: Option<Instant>,
    ) -> Result<u64, Error> {
        let cmd = self.start(id, sql, params, deadline)?;
        let result = self.drain(cmd, Stage::Execute);
        self.disarm();
        result.map_err(|e| status::with_sql(e, sql))
    }

    /// Cancel pending results and deallocate statement `id`.
    ///
    /// The statement stays live when the deallocation fails.
    pub(crate) fn deallocate(&mut self, id: u64) -> Result<(), Error> {
        let Some((cmd, name)) = self.statements.get(&id).map(|s| (s.cmd, s.name.clone())) else {
            return Ok(());
        };
        self.cancel(cmd, CancelKind::All, Stage::Deallocate)?;
        self.discard_messages();
        let c_name = c_string(&name, "statement name")?;
        let rc = self.lib.ct_dynamic(cmd, DynamicOp::Deallocate, &c_name, None);
        self.check(rc, Verb::Dynamic, Stage::Deallocate)?;
        let sent = self.lib.ct_send(cmd);
        if !sent.is_succeed() {
            let err = self.fail(sent, Verb::Send, Stage::Deallocate);
            self.cancel_quietly(cmd, CancelKind::All);
            return Err(err);
        }
        self.drain(cmd, Stage::Deallocate)?;

        if let Some(live) = self.statements.remove(&id) {
            self.names.release(live.number);
        }
        tracing::debug!(statement = %name, "deallocated statement");
        let rc = self.lib.ct_cmd_drop(cmd);
        self.check(rc, Verb::CmdDrop, Stage::Deallocate)
    }

    // ---------- close ----------

    fn close(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        let mut first: Option<Error> = None;

        let ids: Vec<u64> = self.statements.keys().copied().collect();
        for id in ids {
            if let Err(err) = self.deallocate(id) {
                tracing::warn!(error = %err, "failed to deallocate statement on close");
                if let Some(live) = self.statements.remove(&id) {
                    let rc = self.lib.ct_cmd_drop(live.cmd);
                    if !rc.is_succeed() {
                        tracing::warn!(status = %rc, "ct_cmd_drop failed on close");
                    }
                }
                first.get_or_insert(err);
            }
        }
        self.disarm();
        self.open = false;
        self.tx = TxState::None;

        let rc = self.lib.ct_close(self.con, CloseOption::Unused);
        if !rc.is_succeed() {
            let err = self.fail(rc, Verb::Close, Stage::Close);
            first.get_or_insert(err);
            let forced = self.lib.ct_close(self.con, CloseOption::Force);
            if !forced.is_succeed() {
                tracing::warn!(status = %forced, "forced ct_close failed");
            }
        }
        let rc = self.lib.ct_con_drop(self.con);
        if !rc.is_succeed() {
            let err = self.fail(rc, Verb::ConDrop, Stage::Close);
            first.get_or_insert(err);
        }
        self.context.release();
        tracing::debug!(library = self.lib.name(), "closed connection");

        first.map_or(Ok(()), Err)
    }
}

// ==================== Open ====================

enum Undo {
    Release,
    DropConnection(RawConnection),
    Close(RawConnection),
}

/// Undo stack for a partially opened connection; unwinds on drop unless
/// disarmed.
struct OpenGuard<'a> {
    context: &'a ContextManager,
    lib: &'a dyn ClientLibrary,
    stack: Vec<Undo>,
}

impl OpenGuard<'_> {
    fn push(&mut self, undo: Undo) {
        self.stack.push(undo);
    }

    fn disarm(mut self) {
        self.stack.clear();
    }
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        while let Some(undo) = self.stack.pop() {
            let rc = match undo {
                Undo::Release => {
                    self.context.release();
                    continue;
                }
                Undo::DropConnection(con) => self.lib.ct_con_drop(con),
                Undo::Close(con) => self.lib.ct_close(con, CloseOption::Force),
            };
            if !rc.is_succeed() {
                tracing::warn!(status = %rc, "cleanup after failed open did not succeed");
            }
        }
    }
}

/// Whether `name` can be sent unquoted as a database or savepoint name.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '#' || c == '@')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '#' | '@' | '$'))
        && name.len() <= 255
}

fn set_property(
    lib: &dyn ClientLibrary,
    con: RawConnection,
    property: ConProperty,
    value: &str,
    what: &str,
) -> Result<(), Error> {
    let value = CString::new(value).map_err(|_| Error::config(format!("{what} contains a NUL byte")))?;
    let rc = lib.ct_con_props(con, property, &value);
    if rc.is_succeed() {
        Ok(())
    } else {
        Err(status::failure(
            rc,
            Verb::ConProps,
            Stage::Connect,
            &lib.take_messages(con),
        ))
    }
}

fn open_session(context: &Arc<ContextManager>, config: &AseConfig) -> Result<Session, Error> {
    if let Some(db) = &config.database {
        if !is_identifier(db) {
            return Err(Error::config(format!("invalid database name '{db}'")));
        }
    }
    let host = config
        .host
        .as_deref()
        .filter(|h| !h.is_empty())
        .map(|h| CString::new(h).map_err(|_| Error::config("host contains a NUL byte")))
        .transpose()?;

    let (lib, ctx) = context.acquire()?;
    let mut guard = OpenGuard {
        context,
        lib: lib.as_ref(),
        stack: vec![Undo::Release],
    };

    let con = lib
        .ct_con_alloc(ctx)
        .map_err(|rc| status::failure(rc, Verb::ConAlloc, Stage::Connect, &[]))?;
    guard.push(Undo::DropConnection(con));

    set_property(lib.as_ref(), con, ConProperty::Username, &config.username, "username")?;
    set_property(lib.as_ref(), con, ConProperty::Password, &config.password, "password")?;
    if let Some(app) = &config.app_name {
        set_property(lib.as_ref(), con, ConProperty::AppName, app, "application name")?;
    }
    let text_limit = i32::try_from(config.text_limit).unwrap_or(i32::MAX);
    let rc = lib.ct_text_limit(con, text_limit);
    if !rc.is_succeed() {
        return Err(status::failure(
            rc,
            Verb::TextLimit,
            Stage::Connect,
            &lib.take_messages(con),
        ));
    }

    let rc = lib.ct_connect(con, host.as_deref());
    if !rc.is_succeed() {
        return Err(status::failure(
            rc,
            Verb::Connect,
            Stage::Connect,
            &lib.take_messages(con),
        ));
    }
    guard.push(Undo::Close(con));

    let mut session = Session {
        lib: lib.clone(),
        context: context.clone(),
        con,
        open: true,
        names: NameAllocator::default(),
        statements: BTreeMap::new(),
        next_id: 0,
        tx: TxState::None,
        timeout_armed: false,
        query_timeout: config.query_timeout,
        text_limit: config.text_limit,
    };
    if let Some(db) = &config.database {
        session.run_language(&format!("use {db}"), Stage::Connect)?;
    }

    guard.disarm();
    tracing::debug!(
        library = lib.name(),
        host = config.host.as_deref().unwrap_or("<default>"),
        database = config.database.as_deref(),
        "connected"
    );
    Ok(session)
}

// ==================== AseConnection ====================

/// A connection to an ASE server.
pub struct AseConnection {
    session: Arc<Mutex<Session>>,
    config: AseConfig,
}

impl std::fmt::Debug for AseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AseConnection")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl AseConnection {
    /// Open a connection through the process-wide client library.
    pub fn open(config: &AseConfig) -> Result<Self, Error> {
        Self::open_with(&ContextManager::global(), config)
    }

    /// Open a connection through `context`.
    pub fn open_with(context: &Arc<ContextManager>, config: &AseConfig) -> Result<Self, Error> {
        let session = open_session(context, config)?;
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &AseConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        !lock(&self.session).open
    }

    pub(crate) fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    /// Close the session and release the connection handle.
    ///
    /// Live statements are deallocated first. Every step runs even if an
    /// earlier one fails; the first failure is returned. A second call fails
    /// with "connection closed".
    pub fn disconnect(&self) -> Result<(), Error> {
        lock(&self.session).close()
    }

    /// Run a language command, returning the rows affected.
    pub fn execute_raw(&self, sql: &str) -> Result<u64, Error> {
        lock(&self.session).execute_language(sql)
    }

    /// Probe the server with `SELECT 1`.
    pub fn ping_with_deadline(&self, deadline: Option<Instant>) -> Result<(), Error> {
        let mut session = lock(&self.session);
        session.ensure_open()?;
        let seconds = session.timeout_for(deadline)?;
        session.arm(seconds)?;
        let result = session.run_language("SELECT 1", Stage::Execute);
        session.disarm();
        result.map(|_| ())
    }

    /// Prepare `sql` as a dynamic statement.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn prepare_statement(&self, sql: &str) -> Result<AseStatement, Error> {
        let (id, name) = lock(&self.session).prepare(sql)?;
        Ok(AseStatement::new(
            Arc::clone(&self.session),
            id,
            name,
            sql.to_string(),
        ))
    }

    /// Start a transaction at the server's default isolation level.
    pub fn begin_transaction(&self) -> Result<AseTransaction<'_>, Error> {
        self.begin_sync(None)
    }

    /// Start a transaction at `isolation`.
    pub fn begin_transaction_with(
        &self,
        isolation: IsolationLevel,
    ) -> Result<AseTransaction<'_>, Error> {
        self.begin_sync(Some(isolation))
    }

    fn begin_sync(&self, isolation: Option<IsolationLevel>) -> Result<AseTransaction<'_>, Error> {
        let mut session = lock(&self.session);
        session.ensure_open()?;
        if session.tx != TxState::None {
            return Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                message: "a transaction is already active on this connection".to_string(),
            }));
        }
        session.tx = TxState::Pending(isolation);
        drop(session);
        Ok(AseTransaction::new(self))
    }

    pub(crate) fn query_sync(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let mut stmt = self.prepare_statement(sql)?;
        let rows = stmt
            .query(params)
            .and_then(|cursor| cursor.collect::<Result<Vec<_>, _>>());
        let closed = stmt.close();
        let rows = rows?;
        closed?;
        Ok(rows)
    }

    pub(crate) fn execute_sync(&self, sql: &str, params: &[Value]) -> Result<u64, Error> {
        let mut stmt = self.prepare_statement(sql)?;
        let result = stmt.exec(params);
        let closed = stmt.close();
        let result = result?;
        closed?;
        Ok(result.rows_affected())
    }

    fn insert_sync(&self, sql: &str, params: &[Value]) -> Result<i64, Error> {
        self.execute_sync(sql, params)?;
        let rows = self.query_sync("SELECT @@identity", &[])?;
        let value = rows.first().and_then(|row| row.get(0)).cloned();
        match value {
            Some(Value::Decimal(d)) if d.scale() == 0 => i64::try_from(d.unscaled())
                .map_err(|_| Error::Custom(format!("identity value {d} does not fit in i64"))),
            Some(Value::BigInt(v)) => Ok(v),
            Some(Value::Null) | None => Ok(0),
            Some(other) => Err(Error::Custom(format!(
                "unexpected @@identity value of type {}",
                other.type_name()
            ))),
        }
    }

    fn prepare_sync(&self, sql: &str) -> Result<PreparedStatement, Error> {
        let mut stmt = self.prepare_statement(sql)?;
        let id = stmt.id();
        stmt.close()?;
        Ok(PreparedStatement::new(id, sql.to_string(), None))
    }
}

impl Drop for AseConnection {
    fn drop(&mut self) {
        let mut session = lock(&self.session);
        if session.open {
            if let Err(err) = session.close() {
                tracing::warn!(error = %err, "failed to close connection on drop");
            }
        }
    }
}

fn cancelled<T>(cx: &Cx) -> Option<Outcome<T, Error>> {
    cx.cancel_reason().map(Outcome::Cancelled)
}

// Implement Connection trait for AseConnection
impl Connection for AseConnection {
    type Tx<'conn>
        = AseTransaction<'conn>
    where
        Self: 'conn;

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.query_sync(sql, params)
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
            self.query_sync(sql, params)
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
            self.execute_sync(sql, params)
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.insert_sync(sql, params)
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            statements
                .iter()
                .map(|(sql, params)| self.execute_sync(sql, params))
                .collect::<Result<Vec<_>, _>>()
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let result = cancelled(cx)
            .unwrap_or_else(|| self.begin_sync(None).map_or_else(Outcome::Err, Outcome::Ok));
        async move { result }
    }

    fn begin_with(
        &self,
        cx: &Cx,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Outcome<Self::Tx<'_>, Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.begin_sync(Some(isolation))
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    fn prepare(
        &self,
        cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        let result = cancelled(cx)
            .unwrap_or_else(|| self.prepare_sync(sql).map_or_else(Outcome::Err, Outcome::Ok));
        async move { result }
    }

    fn query_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        // The record holds no server resource; prepare again.
        self.query(cx, stmt.sql(), params)
    }

    fn execute_prepared(
        &self,
        cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        self.execute(cx, stmt.sql(), params)
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = cancelled(cx).unwrap_or_else(|| {
            self.ping_with_deadline(None)
                .map_or_else(Outcome::Err, Outcome::Ok)
        });
        async move { result }
    }

    async fn close(self, _cx: &Cx) -> sqlmodel_core::Result<()> {
        self.disconnect()
    }
}

// ==================== Driver ====================

/// Opens [`AseConnection`]s from DSN strings.
#[derive(Debug, Clone)]
pub struct AseDriver {
    context: Arc<ContextManager>,
}

impl Default for AseDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AseDriver {
    /// A driver over the process-wide client library.
    pub fn new() -> Self {
        Self::with_context(ContextManager::global())
    }

    /// A driver over `library`, with its own context.
    pub fn with_library(library: Arc<dyn ClientLibrary>) -> Self {
        Self::with_context(Arc::new(ContextManager::new(library)))
    }

    pub fn with_context(context: Arc<ContextManager>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    /// Open a connection from a DSN string.
    pub fn open(&self, dsn: &str) -> Result<AseConnection, Error> {
        self.connect(&AseConfig::from_dsn(dsn)?)
    }

    pub fn connect(&self, config: &AseConfig) -> Result<AseConnection, Error> {
        AseConnection::open_with(&self.context, config)
    }
}

impl Driver for AseDriver {
    type Connection = AseConnection;

    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn open(&self, dsn: &str) -> Result<AseConnection, Error> {
        AseDriver::open(self, dsn)
    }
}

/// Register the driver under [`DRIVER_NAME`]. Calling it again is a no-op.
pub fn register() -> Result<(), Error> {
    if sqlmodel_core::driver::is_registered(DRIVER_NAME) {
        return Ok(());
    }
    match sqlmodel_core::driver::register(AseDriver::new()) {
        Err(_) if sqlmodel_core::driver::is_registered(DRIVER_NAME) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLibrary;

    fn driver() -> (Arc<MockLibrary>, AseDriver) {
        let lib = Arc::new(MockLibrary::new());
        let driver = AseDriver::with_library(lib.clone());
        (lib, driver)
    }

    #[test]
    fn names_recycle_smallest_first() {
        let mut names = NameAllocator::default();
        assert_eq!(names.allocate(), 1);
        assert_eq!(names.allocate(), 2);
        assert_eq!(names.allocate(), 3);
        names.release(3);
        names.release(1);
        assert_eq!(names.allocate(), 1);
        assert_eq!(names.allocate(), 3);
        assert_eq!(names.allocate(), 4);
        assert_eq!(statement_name(7), "dyn7");
    }

    #[test]
    fn deadline_to_seconds() {
        let now = Instant::now();
        assert!(matches!(timeout_seconds(now, now), Err(Error::Timeout)));
        assert_eq!(
            timeout_seconds(now + Duration::from_millis(1), now).unwrap(),
            1
        );
        assert_eq!(
            timeout_seconds(now + Duration::from_millis(1500), now).unwrap(),
            2
        );
        assert_eq!(timeout_seconds(now + Duration::from_secs(3), now).unwrap(), 3);
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("pubs2"));
        assert!(is_identifier("#tmp"));
        assert!(!is_identifier("pubs; drop"));
        assert!(!is_identifier("1db"));
        assert!(!is_identifier(""));
    }

    #[test]
    fn empty_host_uses_directory_default() {
        let (lib, driver) = driver();
        let conn = driver.open("user=sa password=secret").unwrap();
        assert_eq!(lib.connect_targets(), vec![None]);
        conn.disconnect().unwrap();

        let conn = driver.open("user=sa password=secret host=SYBASE").unwrap();
        assert_eq!(lib.connect_targets()[1].as_deref(), Some("SYBASE"));
        drop(conn);
        assert_eq!(lib.live_connections(), 0);
    }

    #[test]
    fn use_database_after_connect() {
        let (lib, driver) = driver();
        let conn = driver.open("user=sa password=secret database=pubs2").unwrap();
        assert_eq!(lib.language_commands(), vec!["use pubs2".to_string()]);
        assert_eq!(lib.databases_in_use(), vec!["pubs2".to_string()]);
        conn.disconnect().unwrap();
    }

    #[test]
    fn invalid_database_name_is_rejected_before_connecting() {
        let (lib, driver) = driver();
        let err = driver.open("user=sa password=x db='a;b'").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(lib.calls().is_empty());
    }

    #[test]
    fn app_name_is_set() {
        let (lib, driver) = driver();
        let config = AseConfig::from_dsn("user=sa password=x")
            .unwrap()
            .app_name("billing");
        let conn = driver.connect(&config).unwrap();
        assert_eq!(lib.property(ConProperty::AppName), vec!["billing".to_string()]);
        conn.disconnect().unwrap();
    }

    #[test]
    fn text_limit_is_applied() {
        let (lib, driver) = driver();
        let conn = driver.open("user=sa password=x").unwrap();
        assert_eq!(lib.text_limits(), vec![32 * 1024]);
        conn.disconnect().unwrap();

        let config = AseConfig::from_dsn("user=sa password=x")
            .unwrap()
            .text_limit(1 << 20);
        let conn = driver.connect(&config).unwrap();
        assert_eq!(lib.text_limits(), vec![1 << 20]);
        conn.disconnect().unwrap();

        let huge = AseConfig::from_dsn("user=sa password=x")
            .unwrap()
            .text_limit(usize::MAX);
        let conn = driver.connect(&huge).unwrap();
        assert_eq!(lib.text_limits(), vec![i32::MAX]);
        conn.disconnect().unwrap();
    }

    #[test]
    fn query_timeout_from_config() {
        let (lib, driver) = driver();
        let config = AseConfig::from_dsn("user=sa password=x")
            .unwrap()
            .query_timeout(Duration::from_millis(2500));
        let conn = driver.connect(&config).unwrap();
        conn.execute_raw("SELECT 1").unwrap();
        assert_eq!(lib.timeouts(), vec![Some(3), None]);
        conn.disconnect().unwrap();
    }
}
