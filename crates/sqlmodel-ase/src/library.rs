//! The CT-Library surface the driver is written against.
//!
//! [`ClientLibrary`] has one method per native routine the driver calls.
//! `native::NativeLibrary` (feature `ctlib`) forwards to the linked Open
//! Client libraries; `mock::MockLibrary` (feature `mock`) is an in-memory
//! server used by the tests. Methods mirror the C calling
//! convention: statuses are returned, never raised, and the driver decides
//! what a status means.

use std::ffi::CStr;

use crate::ffi;
use crate::status::{Diagnostic, RetCode};
use crate::types::DbType;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            pub const fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> usize {
                self.0
            }
        }
    };
}

raw_handle!(
    /// A `CS_CONTEXT *`.
    RawContext
);
raw_handle!(
    /// A `CS_CONNECTION *`.
    RawConnection
);
raw_handle!(
    /// A `CS_COMMAND *`.
    RawCommand
);

/// Connection properties set before `ct_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConProperty {
    Username,
    Password,
    AppName,
    HostName,
}

impl ConProperty {
    pub const fn code(self) -> ffi::CS_INT {
        match self {
            ConProperty::Username => ffi::CS_USERNAME,
            ConProperty::Password => ffi::CS_PASSWORD,
            ConProperty::AppName => ffi::CS_APPNAME,
            ConProperty::HostName => ffi::CS_HOSTNAME,
        }
    }
}

/// `ct_close` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOption {
    /// Orderly close; fails while results are pending.
    Unused,
    /// Drop the session regardless of its state.
    Force,
}

/// `ct_dynamic` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicOp {
    Prepare,
    Execute,
    Deallocate,
}

impl DynamicOp {
    pub const fn code(self) -> ffi::CS_INT {
        match self {
            DynamicOp::Prepare => ffi::CS_PREPARE,
            DynamicOp::Execute => ffi::CS_EXECUTE,
            DynamicOp::Deallocate => ffi::CS_DEALLOC,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DynamicOp::Prepare => "CS_PREPARE",
            DynamicOp::Execute => "CS_EXECUTE",
            DynamicOp::Deallocate => "CS_DEALLOC",
        }
    }
}

/// What `ct_results` found next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Row,
    Cursor,
    Param,
    Status,
    Compute,
    Describe,
    RowFormat,
    ComputeFormat,
    Message,
    CmdSucceed,
    CmdDone,
    CmdFail,
}

impl ResultType {
    pub fn from_code(code: ffi::CS_INT) -> Option<Self> {
        Some(match code {
            ffi::CS_ROW_RESULT => ResultType::Row,
            ffi::CS_CURSOR_RESULT => ResultType::Cursor,
            ffi::CS_PARAM_RESULT => ResultType::Param,
            ffi::CS_STATUS_RESULT => ResultType::Status,
            ffi::CS_COMPUTE_RESULT => ResultType::Compute,
            ffi::CS_DESCRIBE_RESULT => ResultType::Describe,
            ffi::CS_ROWFMT_RESULT => ResultType::RowFormat,
            ffi::CS_COMPUTEFMT_RESULT => ResultType::ComputeFormat,
            ffi::CS_MSG_RESULT => ResultType::Message,
            ffi::CS_CMD_SUCCEED => ResultType::CmdSucceed,
            ffi::CS_CMD_DONE => ResultType::CmdDone,
            ffi::CS_CMD_FAIL => ResultType::CmdFail,
            _ => return None,
        })
    }

    /// Results that carry fetchable rows.
    pub const fn has_rows(self) -> bool {
        matches!(
            self,
            ResultType::Row
                | ResultType::Cursor
                | ResultType::Param
                | ResultType::Status
                | ResultType::Compute
        )
    }
}

/// `ct_res_info` item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResInfo {
    /// Number of columns in the current result set.
    NumData,
    /// Rows affected by the command just completed; `CS_NO_COUNT` when unknown.
    RowCount,
}

/// `ct_cancel` type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Discard the rest of the current result set.
    Current,
    /// Discard every pending result of the command.
    All,
    /// Send an attention to the server; used after a timeout.
    Attention,
}

impl CancelKind {
    pub const fn code(self) -> ffi::CS_INT {
        match self {
            CancelKind::Current => ffi::CS_CANCEL_CURRENT,
            CancelKind::All => ffi::CS_CANCEL_ALL,
            CancelKind::Attention => ffi::CS_CANCEL_ATTN,
        }
    }
}

/// What a `ct_cancel` applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTarget {
    Connection(RawConnection),
    Command(RawCommand),
}

/// The Rust side of a `CS_DATAFMT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFormat {
    pub name: String,
    pub datatype: DbType,
    pub maxlength: i32,
    pub precision: i32,
    pub scale: i32,
    pub status: i32,
    pub usertype: i32,
}

impl DataFormat {
    pub fn new(datatype: DbType, maxlength: i32) -> Self {
        Self {
            name: String::new(),
            datatype,
            maxlength,
            precision: 0,
            scale: 0,
            status: 0,
            usertype: 0,
        }
    }

    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        if nullable {
            self.status |= ffi::CS_CANBENULL;
        } else {
            self.status &= !ffi::CS_CANBENULL;
        }
        self
    }

    pub const fn is_nullable(&self) -> bool {
        self.status & ffi::CS_CANBENULL != 0
    }
}

/// A receive buffer bound to one result column.
///
/// `data` has the bound capacity; after a fetch `len` bytes are valid and
/// `indicator` is `-1` for NULL.
#[derive(Debug, Clone)]
pub struct ColumnBuffer {
    pub format: DataFormat,
    pub data: Vec<u8>,
    pub len: i32,
    pub indicator: i16,
}

impl ColumnBuffer {
    pub fn new(format: DataFormat, capacity: usize) -> Self {
        Self {
            format,
            data: vec![0; capacity],
            len: 0,
            indicator: 0,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.indicator == -1
    }

    /// The bytes written by the last fetch.
    pub fn filled(&self) -> &[u8] {
        let len = usize::try_from(self.len).unwrap_or(0).min(self.data.len());
        &self.data[..len]
    }
}

/// The CT-Library routines used by the driver.
///
/// Implementations must be callable from any thread. The driver serializes
/// calls per connection; calls for different connections may run
/// concurrently.
pub trait ClientLibrary: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn cs_ctx_alloc(&self, version: i32) -> Result<RawContext, RetCode>;
    fn ct_init(&self, ctx: RawContext, version: i32) -> RetCode;
    fn ct_exit(&self, ctx: RawContext, force: bool) -> RetCode;
    fn cs_ctx_drop(&self, ctx: RawContext) -> RetCode;

    fn ct_con_alloc(&self, ctx: RawContext) -> Result<RawConnection, RetCode>;
    fn ct_con_props(&self, con: RawConnection, property: ConProperty, value: &CStr) -> RetCode;
    /// `None` connects through the server directory's default entry.
    fn ct_connect(&self, con: RawConnection, server: Option<&CStr>) -> RetCode;
    fn ct_close(&self, con: RawConnection, option: CloseOption) -> RetCode;
    fn ct_con_drop(&self, con: RawConnection) -> RetCode;
    /// Set the network read timeout in seconds; `None` clears it.
    fn ct_timeout(&self, con: RawConnection, seconds: Option<i32>) -> RetCode;
    /// Largest text or image value, in bytes, the library returns per column.
    fn ct_text_limit(&self, con: RawConnection, bytes: i32) -> RetCode;

    fn ct_cmd_alloc(&self, con: RawConnection) -> Result<RawCommand, RetCode>;
    fn ct_cmd_drop(&self, cmd: RawCommand) -> RetCode;
    /// Initiate a language command.
    fn ct_command(&self, cmd: RawCommand, text: &CStr) -> RetCode;
    /// `text` is the SQL for [`DynamicOp::Prepare`] and `None` otherwise.
    fn ct_dynamic(&self, cmd: RawCommand, op: DynamicOp, name: &CStr, text: Option<&CStr>)
    -> RetCode;
    /// `None` data binds NULL.
    fn ct_param(&self, cmd: RawCommand, format: &DataFormat, data: Option<&[u8]>) -> RetCode;
    fn ct_send(&self, cmd: RawCommand) -> RetCode;
    /// `Err(END_RESULTS)` once the command is fully processed.
    fn ct_results(&self, cmd: RawCommand) -> Result<ResultType, RetCode>;
    fn ct_res_info(&self, cmd: RawCommand, info: ResInfo) -> Result<i32, RetCode>;
    /// Describe 1-based result column `item`.
    fn ct_describe(&self, cmd: RawCommand, item: i32) -> Result<DataFormat, RetCode>;
    /// Bind `buffers` to the current result set and fetch one row into them.
    fn ct_fetch(&self, cmd: RawCommand, buffers: &mut [ColumnBuffer]) -> RetCode;
    fn ct_cancel(&self, target: CancelTarget, kind: CancelKind) -> RetCode;

    /// Drain diagnostics reported for `con` since the last call.
    fn take_messages(&self, con: RawConnection) -> Vec<Diagnostic>;
}
