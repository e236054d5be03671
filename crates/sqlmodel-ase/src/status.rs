//! Native return codes and their mapping onto [`sqlmodel_core::Error`].
//!
//! Every CT-Library call returns a status code. [`check`] turns anything but
//! `CS_SUCCEED` into an error whose message starts with the failing routine
//! name; [`failure`] does the same with the diagnostics the library reported
//! for the call.

use std::fmt;

use sqlmodel_core::Error;
use sqlmodel_core::error::{
    ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind, ResourceError,
};

use crate::ffi;

/// A CT-Library status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetCode(pub ffi::CS_RETCODE);

impl RetCode {
    pub const SUCCEED: Self = Self(ffi::CS_SUCCEED);
    pub const FAIL: Self = Self(ffi::CS_FAIL);
    pub const MEM_ERROR: Self = Self(ffi::CS_MEM_ERROR);
    pub const PENDING: Self = Self(ffi::CS_PENDING);
    pub const BUSY: Self = Self(ffi::CS_BUSY);
    pub const CANCELED: Self = Self(ffi::CS_CANCELED);
    pub const ROW_FAIL: Self = Self(ffi::CS_ROW_FAIL);
    pub const END_DATA: Self = Self(ffi::CS_END_DATA);
    pub const END_RESULTS: Self = Self(ffi::CS_END_RESULTS);
    /// The network timeout configured for the connection expired.
    ///
    /// CT-Library signals this through a client message; [`ClientLibrary`]
    /// implementations report it with this code instead of `CS_FAIL`.
    ///
    /// [`ClientLibrary`]: crate::library::ClientLibrary
    pub const TIMED_OUT: Self = Self(-9000);

    pub const fn is_succeed(self) -> bool {
        self.0 == ffi::CS_SUCCEED
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            ffi::CS_SUCCEED => "CS_SUCCEED",
            ffi::CS_FAIL => "CS_FAIL",
            ffi::CS_MEM_ERROR => "CS_MEM_ERROR",
            ffi::CS_PENDING => "CS_PENDING",
            ffi::CS_BUSY => "CS_BUSY",
            ffi::CS_CANCELED => "CS_CANCELED",
            ffi::CS_ROW_FAIL => "CS_ROW_FAIL",
            ffi::CS_END_DATA => "CS_END_DATA",
            ffi::CS_END_RESULTS => "CS_END_RESULTS",
            -9000 => "timed out",
            _ => "unknown status",
        }
    }
}

impl fmt::Display for RetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// The native routine a status code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    CtxAlloc,
    Init,
    Exit,
    CtxDrop,
    ConAlloc,
    ConProps,
    Connect,
    Close,
    ConDrop,
    Timeout,
    TextLimit,
    CmdAlloc,
    CmdDrop,
    Command,
    Dynamic,
    Param,
    Send,
    Results,
    ResInfo,
    Describe,
    Fetch,
    Cancel,
}

impl Verb {
    pub const fn name(self) -> &'static str {
        match self {
            Verb::CtxAlloc => "cs_ctx_alloc",
            Verb::Init => "ct_init",
            Verb::Exit => "ct_exit",
            Verb::CtxDrop => "cs_ctx_drop",
            Verb::ConAlloc => "ct_con_alloc",
            Verb::ConProps => "ct_con_props",
            Verb::Connect => "ct_connect",
            Verb::Close => "ct_close",
            Verb::ConDrop => "ct_con_drop",
            Verb::Timeout => "ct_con_props(CS_TIMEOUT)",
            Verb::TextLimit => "ct_con_props(CS_TEXTLIMIT)",
            Verb::CmdAlloc => "ct_cmd_alloc",
            Verb::CmdDrop => "ct_cmd_drop",
            Verb::Command => "ct_command",
            Verb::Dynamic => "ct_dynamic",
            Verb::Param => "ct_param",
            Verb::Send => "ct_send",
            Verb::Results => "ct_results",
            Verb::ResInfo => "ct_res_info",
            Verb::Describe => "ct_describe",
            Verb::Fetch => "ct_fetch",
            Verb::Cancel => "ct_cancel",
        }
    }

    const fn allocates(self) -> bool {
        matches!(self, Verb::CtxAlloc | Verb::ConAlloc | Verb::CmdAlloc)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which driver operation was running; selects the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Connect,
    Prepare,
    Execute,
    Fetch,
    Deallocate,
    Close,
    /// Transaction control statements issued by the driver.
    Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticSource {
    Server,
    Client,
}

/// A message delivered through the client or server message callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub source: DiagnosticSource,
    pub number: i32,
    pub severity: i32,
    pub state: i32,
    pub text: String,
    pub sqlstate: Option<String>,
}

impl Diagnostic {
    pub fn server(number: i32, severity: i32, text: impl Into<String>) -> Self {
        Self {
            source: DiagnosticSource::Server,
            number,
            severity,
            state: 1,
            text: text.into(),
            sqlstate: None,
        }
    }

    pub fn client(number: i32, severity: i32, text: impl Into<String>) -> Self {
        Self {
            source: DiagnosticSource::Client,
            number,
            severity,
            state: 0,
            text: text.into(),
            sqlstate: None,
        }
    }

    /// Server messages at severity 10 and below are informational (print, showplan).
    pub fn is_error(&self) -> bool {
        match self.source {
            DiagnosticSource::Server => self.severity > 10,
            DiagnosticSource::Client => true,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.source {
            DiagnosticSource::Server => write!(
                f,
                "{} (Msg {}, Level {}, State {})",
                self.text, self.number, self.severity, self.state
            ),
            DiagnosticSource::Client => write!(f, "{}", self.text),
        }
    }
}

/// Login rejected by the server.
const LOGIN_FAILED: i32 = 4002;
/// Server message raised on the transaction chosen as deadlock victim.
const DEADLOCK_VICTIM: i32 = 1205;

/// Fail with `verb`'s name unless `rc` is `CS_SUCCEED`.
pub fn check(rc: RetCode, verb: Verb, stage: Stage) -> sqlmodel_core::Result<()> {
    if rc.is_succeed() {
        Ok(())
    } else {
        Err(failure(rc, verb, stage, &[]))
    }
}

/// Build the error for a failed native call.
pub fn failure(rc: RetCode, verb: Verb, stage: Stage, diagnostics: &[Diagnostic]) -> Error {
    if rc == RetCode::TIMED_OUT {
        return Error::Timeout;
    }

    let primary = diagnostics.iter().find(|d| d.is_error());
    let detail = primary.map_or_else(|| rc.to_string(), ToString::to_string);
    let message = format!("{verb} failed: {detail}");

    if rc == RetCode::MEM_ERROR || (verb.allocates() && stage != Stage::Init) {
        return Error::Resource(ResourceError {
            verb: verb.name(),
            message,
        });
    }

    match stage {
        Stage::Init => connection_error(ConnectionErrorKind::NotInitialized, message),
        Stage::Connect => {
            let kind = if primary.is_some_and(|d| d.number == LOGIN_FAILED) {
                ConnectionErrorKind::Authentication
            } else {
                ConnectionErrorKind::Connect
            };
            connection_error(kind, message)
        }
        Stage::Close => connection_error(ConnectionErrorKind::Disconnected, message),
        Stage::Prepare => query_error(QueryErrorKind::Prepare, message, primary),
        Stage::Execute | Stage::Transaction => {
            query_error(QueryErrorKind::Execute, message, primary)
        }
        Stage::Fetch => query_error(QueryErrorKind::Fetch, message, primary),
        Stage::Deallocate => query_error(QueryErrorKind::Database, message, primary),
    }
}

/// Build the error for a `CS_CMD_FAIL` result.
pub fn command_failed(stage: Stage, diagnostics: &[Diagnostic]) -> Error {
    let primary = diagnostics.iter().find(|d| d.is_error());
    let detail = primary.map_or_else(
        || "the server rejected the command".to_string(),
        ToString::to_string,
    );
    let message = format!("ct_results failed: {detail}");
    match stage {
        Stage::Connect => connection_error(ConnectionErrorKind::Connect, message),
        Stage::Init | Stage::Close => connection_error(ConnectionErrorKind::Disconnected, message),
        Stage::Prepare => query_error(QueryErrorKind::Prepare, message, primary),
        Stage::Fetch => query_error(QueryErrorKind::Fetch, message, primary),
        Stage::Execute | Stage::Deallocate | Stage::Transaction => {
            query_error(QueryErrorKind::Execute, message, primary)
        }
    }
}

/// Attach the SQL text to query errors.
pub fn with_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::Query(q) if q.sql.is_none() => Error::Query(q.with_sql(sql)),
        other => other,
    }
}

fn connection_error(kind: ConnectionErrorKind, message: String) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message,
        source: None,
    })
}

fn query_error(kind: QueryErrorKind, message: String, diag: Option<&Diagnostic>) -> Error {
    let server = diag.filter(|d| d.source == DiagnosticSource::Server);
    let kind = if server.is_some_and(|d| d.number == DEADLOCK_VICTIM) {
        QueryErrorKind::Deadlock
    } else {
        kind
    };
    let mut err = QueryError::new(kind, message);
    if let Some(d) = server {
        err.code = Some(d.number);
        err.severity = Some(d.severity);
        err.sqlstate.clone_from(&d.sqlstate);
    }
    Error::Query(err)
}
