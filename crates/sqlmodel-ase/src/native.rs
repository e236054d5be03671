//! [`ClientLibrary`] over the linked Open Client libraries.
//!
//! Diagnostics arrive through the client and server message callbacks and
//! are queued per connection until the driver drains them with
//! [`take_messages`](ClientLibrary::take_messages). A network read timeout
//! is reported by the client callback; the callback sends an attention so
//! the connection survives, and the next `ct_results` on that connection
//! returns [`RetCode::TIMED_OUT`].

#![allow(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, c_char};
use std::ptr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::ffi::{self, CS_COMMAND, CS_CONNECTION, CS_CONTEXT, CS_DATAFMT, CS_INT, CS_RETCODE};
use crate::library::{
    CancelKind, CancelTarget, ClientLibrary, CloseOption, ColumnBuffer, ConProperty, DataFormat,
    DynamicOp, RawCommand, RawConnection, RawContext, ResInfo, ResultType,
};
use crate::status::{Diagnostic, RetCode};
use crate::types::DbType;

/// Client message number of a network read timeout.
const TIMEOUT_NUMBER: CS_INT = 63;
const TIMEOUT_ORIGIN: CS_INT = 2;
const TIMEOUT_LAYER: CS_INT = 1;

#[derive(Default)]
struct Inbox {
    messages: HashMap<usize, Vec<Diagnostic>>,
    timed_out: HashSet<usize>,
}

fn inbox() -> MutexGuard<'static, Inbox> {
    static INBOX: OnceLock<Mutex<Inbox>> = OnceLock::new();
    INBOX
        .get_or_init(|| Mutex::new(Inbox::default()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn text(buf: &[c_char], len: CS_INT) -> String {
    let len = usize::try_from(len).unwrap_or(0).min(buf.len());
    let bytes: Vec<u8> = buf[..len].iter().map(|&c| c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn sqlstate(buf: &[u8], len: CS_INT) -> Option<String> {
    let len = usize::try_from(len).ok()?.min(buf.len());
    (len > 0).then(|| String::from_utf8_lossy(&buf[..len]).into_owned())
}

fn is_timeout(msgnumber: CS_INT) -> bool {
    ffi::cs_severity(msgnumber) == ffi::CS_SV_RETRY_FAIL
        && ffi::cs_number(msgnumber) == TIMEOUT_NUMBER
        && ffi::cs_origin(msgnumber) == TIMEOUT_ORIGIN
        && ffi::cs_layer(msgnumber) == TIMEOUT_LAYER
}

unsafe extern "C" fn client_message(
    _context: *mut CS_CONTEXT,
    connection: *mut CS_CONNECTION,
    message: *mut ffi::CS_CLIENTMSG,
) -> CS_RETCODE {
    // SAFETY: CT-Library passes a valid message for the duration of the call.
    let Some(msg) = (unsafe { message.as_ref() }) else {
        return ffi::CS_SUCCEED;
    };
    let key = connection as usize;
    let mut diag = Diagnostic::client(
        ffi::cs_number(msg.msgnumber),
        ffi::cs_severity(msg.msgnumber),
        text(&msg.msgstring, msg.msgstringlen),
    );
    diag.sqlstate = sqlstate(&msg.sqlstate, msg.sqlstatelen);

    let timed_out = is_timeout(msg.msgnumber);
    {
        let mut inbox = inbox();
        inbox.messages.entry(key).or_default().push(diag);
        if timed_out {
            inbox.timed_out.insert(key);
        }
    }
    if timed_out && !connection.is_null() {
        // SAFETY: `connection` is the live connection the message is about.
        let rc = unsafe { ffi::ct_cancel(connection, ptr::null_mut(), ffi::CS_CANCEL_ATTN) };
        if rc != ffi::CS_SUCCEED {
            tracing::warn!(status = rc, "ct_cancel(CS_CANCEL_ATTN) failed in timeout callback");
        }
    }
    ffi::CS_SUCCEED
}

unsafe extern "C" fn server_message(
    _context: *mut CS_CONTEXT,
    connection: *mut CS_CONNECTION,
    message: *mut ffi::CS_SERVERMSG,
) -> CS_RETCODE {
    // SAFETY: CT-Library passes a valid message for the duration of the call.
    let Some(msg) = (unsafe { message.as_ref() }) else {
        return ffi::CS_SUCCEED;
    };
    let mut diag = Diagnostic::server(msg.msgnumber, msg.severity, text(&msg.text, msg.textlen));
    diag.state = msg.state;
    diag.sqlstate = sqlstate(&msg.sqlstate, msg.sqlstatelen);
    inbox()
        .messages
        .entry(connection as usize)
        .or_default()
        .push(diag);
    ffi::CS_SUCCEED
}

fn ctx_ptr(ctx: RawContext) -> *mut CS_CONTEXT {
    ctx.as_raw() as *mut CS_CONTEXT
}

fn con_ptr(con: RawConnection) -> *mut CS_CONNECTION {
    con.as_raw() as *mut CS_CONNECTION
}

fn cmd_ptr(cmd: RawCommand) -> *mut CS_COMMAND {
    cmd.as_raw() as *mut CS_COMMAND
}

fn to_datafmt(format: &DataFormat) -> CS_DATAFMT {
    let mut name = [0 as c_char; ffi::CS_MAX_CHAR];
    let bytes = format.name.as_bytes();
    let len = bytes.len().min(ffi::CS_MAX_CHAR - 1);
    for (dst, &src) in name.iter_mut().zip(&bytes[..len]) {
        *dst = src as c_char;
    }
    CS_DATAFMT {
        name,
        namelen: CS_INT::try_from(len).unwrap_or(0),
        datatype: format.datatype.code(),
        format: ffi::CS_FMT_UNUSED,
        maxlength: format.maxlength,
        scale: format.scale,
        precision: format.precision,
        status: format.status,
        count: 1,
        usertype: format.usertype,
        locale: ptr::null_mut(),
    }
}

fn from_datafmt(fmt: &CS_DATAFMT) -> DataFormat {
    DataFormat {
        name: text(&fmt.name, fmt.namelen),
        datatype: DbType::from_code(fmt.datatype),
        maxlength: fmt.maxlength,
        precision: fmt.precision,
        scale: fmt.scale,
        status: fmt.status,
        usertype: fmt.usertype,
    }
}

fn empty_datafmt() -> CS_DATAFMT {
    to_datafmt(&DataFormat::new(DbType::Char, 0))
}

/// The linked CT-Library.
#[derive(Debug, Default)]
pub struct NativeLibrary;

impl NativeLibrary {
    pub fn new() -> Self {
        Self
    }
}

impl ClientLibrary for NativeLibrary {
    fn name(&self) -> &'static str {
        "ctlib"
    }

    fn cs_ctx_alloc(&self, version: i32) -> Result<RawContext, RetCode> {
        let mut ctx: *mut CS_CONTEXT = ptr::null_mut();
        // SAFETY: `ctx` is a valid out-pointer.
        let rc = RetCode(unsafe { ffi::cs_ctx_alloc(version, &raw mut ctx) });
        if rc.is_succeed() && !ctx.is_null() {
            Ok(RawContext::from_raw(ctx as usize))
        } else {
            Err(if rc.is_succeed() { RetCode::MEM_ERROR } else { rc })
        }
    }

    fn ct_init(&self, ctx: RawContext, version: i32) -> RetCode {
        let ctx = ctx_ptr(ctx);
        // SAFETY: `ctx` came from cs_ctx_alloc.
        let rc = unsafe { ffi::ct_init(ctx, version) };
        if rc != ffi::CS_SUCCEED {
            return RetCode(rc);
        }
        let client: ffi::CS_CLIENTMSG_FUNC = client_message;
        let server: ffi::CS_SERVERMSG_FUNC = server_message;
        for (kind, func) in [
            (ffi::CS_CLIENTMSG_CB, client as *mut ffi::CS_VOID),
            (ffi::CS_SERVERMSG_CB, server as *mut ffi::CS_VOID),
        ] {
            // SAFETY: the callbacks match the signatures CT-Library expects.
            let rc = unsafe { ffi::ct_callback(ctx, ptr::null_mut(), ffi::CS_SET, kind, func) };
            if rc != ffi::CS_SUCCEED {
                return RetCode(rc);
            }
        }
        RetCode::SUCCEED
    }

    fn ct_exit(&self, ctx: RawContext, force: bool) -> RetCode {
        let option = if force { ffi::CS_FORCE_EXIT } else { ffi::CS_UNUSED };
        // SAFETY: `ctx` came from cs_ctx_alloc.
        RetCode(unsafe { ffi::ct_exit(ctx_ptr(ctx), option) })
    }

    fn cs_ctx_drop(&self, ctx: RawContext) -> RetCode {
        // SAFETY: `ctx` came from cs_ctx_alloc and is dropped once.
        RetCode(unsafe { ffi::cs_ctx_drop(ctx_ptr(ctx)) })
    }

    fn ct_con_alloc(&self, ctx: RawContext) -> Result<RawConnection, RetCode> {
        let mut con: *mut CS_CONNECTION = ptr::null_mut();
        // SAFETY: `con` is a valid out-pointer.
        let rc = RetCode(unsafe { ffi::ct_con_alloc(ctx_ptr(ctx), &raw mut con) });
        if rc.is_succeed() && !con.is_null() {
            Ok(RawConnection::from_raw(con as usize))
        } else {
            Err(if rc.is_succeed() { RetCode::MEM_ERROR } else { rc })
        }
    }

    fn ct_con_props(&self, con: RawConnection, property: ConProperty, value: &CStr) -> RetCode {
        // SAFETY: CT-Library copies the NUL-terminated value during the call.
        RetCode(unsafe {
            ffi::ct_con_props(
                con_ptr(con),
                ffi::CS_SET,
                property.code(),
                value.as_ptr().cast_mut().cast(),
                ffi::CS_NULLTERM,
                ptr::null_mut(),
            )
        })
    }

    fn ct_connect(&self, con: RawConnection, server: Option<&CStr>) -> RetCode {
        let (name, len) = match server {
            Some(s) => (s.as_ptr(), ffi::CS_NULLTERM),
            None => (ptr::null(), 0),
        };
        // SAFETY: `name` is NULL or NUL-terminated.
        RetCode(unsafe { ffi::ct_connect(con_ptr(con), name, len) })
    }

    fn ct_close(&self, con: RawConnection, option: CloseOption) -> RetCode {
        let option = match option {
            CloseOption::Unused => ffi::CS_UNUSED,
            CloseOption::Force => ffi::CS_FORCE_CLOSE,
        };
        // SAFETY: `con` came from ct_con_alloc.
        RetCode(unsafe { ffi::ct_close(con_ptr(con), option) })
    }

    fn ct_con_drop(&self, con: RawConnection) -> RetCode {
        // SAFETY: `con` came from ct_con_alloc and is dropped once.
        let rc = RetCode(unsafe { ffi::ct_con_drop(con_ptr(con)) });
        if rc.is_succeed() {
            let mut inbox = inbox();
            inbox.messages.remove(&con.as_raw());
            inbox.timed_out.remove(&con.as_raw());
        }
        rc
    }

    fn ct_timeout(&self, con: RawConnection, seconds: Option<i32>) -> RetCode {
        let mut value: CS_INT = seconds.unwrap_or(ffi::CS_NO_LIMIT);
        // SAFETY: `value` outlives the call.
        RetCode(unsafe {
            ffi::ct_con_props(
                con_ptr(con),
                ffi::CS_SET,
                ffi::CS_TIMEOUT,
                (&raw mut value).cast(),
                ffi::CS_UNUSED,
                ptr::null_mut(),
            )
        })
    }

    fn ct_text_limit(&self, con: RawConnection, bytes: i32) -> RetCode {
        let mut value: CS_INT = bytes;
        // SAFETY: `value` outlives the call.
        RetCode(unsafe {
            ffi::ct_con_props(
                con_ptr(con),
                ffi::CS_SET,
                ffi::CS_TEXTLIMIT,
                (&raw mut value).cast(),
                ffi::CS_UNUSED,
                ptr::null_mut(),
            )
        })
    }

    fn ct_cmd_alloc(&self, con: RawConnection) -> Result<RawCommand, RetCode> {
        let mut cmd: *mut CS_COMMAND = ptr::null_mut();
        // SAFETY: `cmd` is a valid out-pointer.
        let rc = RetCode(unsafe { ffi::ct_cmd_alloc(con_ptr(con), &raw mut cmd) });
        if rc.is_succeed() && !cmd.is_null() {
            Ok(RawCommand::from_raw(cmd as usize))
        } else {
            Err(if rc.is_succeed() { RetCode::MEM_ERROR } else { rc })
        }
    }

    fn ct_cmd_drop(&self, cmd: RawCommand) -> RetCode {
        // SAFETY: `cmd` came from ct_cmd_alloc and is dropped once.
        RetCode(unsafe { ffi::ct_cmd_drop(cmd_ptr(cmd)) })
    }

    fn ct_command(&self, cmd: RawCommand, text_value: &CStr) -> RetCode {
        // SAFETY: CT-Library copies the NUL-terminated text (CS_UNUSED option).
        RetCode(unsafe {
            ffi::ct_command(
                cmd_ptr(cmd),
                ffi::CS_LANG_CMD,
                text_value.as_ptr().cast(),
                ffi::CS_NULLTERM,
                ffi::CS_UNUSED,
            )
        })
    }

    fn ct_dynamic(
        &self,
        cmd: RawCommand,
        op: DynamicOp,
        name: &CStr,
        text_value: Option<&CStr>,
    ) -> RetCode {
        let (buffer, len) = match text_value {
            Some(t) => (t.as_ptr(), ffi::CS_NULLTERM),
            None => (ptr::null(), ffi::CS_UNUSED),
        };
        // SAFETY: both strings are NULL or NUL-terminated and outlive the call.
        RetCode(unsafe {
            ffi::ct_dynamic(
                cmd_ptr(cmd),
                op.code(),
                name.as_ptr(),
                ffi::CS_NULLTERM,
                buffer,
                len,
            )
        })
    }

    fn ct_param(&self, cmd: RawCommand, format: &DataFormat, data: Option<&[u8]>) -> RetCode {
        let mut fmt = to_datafmt(format);
        let (ptr, len, indicator) = match data {
            Some(bytes) => (
                bytes.as_ptr().cast_mut().cast(),
                CS_INT::try_from(bytes.len()).unwrap_or(CS_INT::MAX),
                0,
            ),
            None => (ptr::null_mut(), 0, -1),
        };
        // SAFETY: ct_param copies the value; `fmt` and `data` outlive the call.
        RetCode(unsafe { ffi::ct_param(cmd_ptr(cmd), &raw mut fmt, ptr, len, indicator) })
    }

    fn ct_send(&self, cmd: RawCommand) -> RetCode {
        // A timeout reported for an earlier command does not apply to this one.
        if let Some(con) = parent(cmd) {
            inbox().timed_out.remove(&con);
        }
        // SAFETY: `cmd` came from ct_cmd_alloc.
        RetCode(unsafe { ffi::ct_send(cmd_ptr(cmd)) })
    }

    fn ct_results(&self, cmd: RawCommand) -> Result<ResultType, RetCode> {
        let mut result_type: CS_INT = 0;
        // SAFETY: `result_type` is a valid out-pointer.
        let rc = RetCode(unsafe { ffi::ct_results(cmd_ptr(cmd), &raw mut result_type) });
        if rc.is_succeed() {
            return ResultType::from_code(result_type).ok_or(RetCode::FAIL);
        }
        if rc == RetCode::END_RESULTS {
            return Err(rc);
        }
        Err(if self.timed_out(cmd) { RetCode::TIMED_OUT } else { rc })
    }

    fn ct_res_info(&self, cmd: RawCommand, info: ResInfo) -> Result<i32, RetCode> {
        let code = match info {
            ResInfo::NumData => ffi::CS_NUMDATA,
            ResInfo::RowCount => ffi::CS_ROW_COUNT,
        };
        let mut value: CS_INT = 0;
        let size = CS_INT::try_from(std::mem::size_of::<CS_INT>()).unwrap_or(4);
        // SAFETY: `value` is a CS_INT out-buffer of `size` bytes.
        let rc = RetCode(unsafe {
            ffi::ct_res_info(
                cmd_ptr(cmd),
                code,
                (&raw mut value).cast(),
                size,
                ptr::null_mut(),
            )
        });
        if rc.is_succeed() { Ok(value) } else { Err(rc) }
    }

    fn ct_describe(&self, cmd: RawCommand, item: i32) -> Result<DataFormat, RetCode> {
        let mut fmt = empty_datafmt();
        // SAFETY: `fmt` is a valid out-structure.
        let rc = RetCode(unsafe { ffi::ct_describe(cmd_ptr(cmd), item, &raw mut fmt) });
        if rc.is_succeed() {
            Ok(from_datafmt(&fmt))
        } else {
            Err(rc)
        }
    }

    fn ct_fetch(&self, cmd: RawCommand, buffers: &mut [ColumnBuffer]) -> RetCode {
        let command = cmd_ptr(cmd);
        for (item, buffer) in (1..).zip(buffers.iter_mut()) {
            let mut fmt = to_datafmt(&buffer.format);
            fmt.maxlength = CS_INT::try_from(buffer.data.len()).unwrap_or(CS_INT::MAX);
            fmt.count = 1;
            // SAFETY: the buffer, length and indicator stay in place until
            // the fetch below returns.
            let rc = unsafe {
                ffi::ct_bind(
                    command,
                    item,
                    &raw mut fmt,
                    buffer.data.as_mut_ptr().cast(),
                    &raw mut buffer.len,
                    &raw mut buffer.indicator,
                )
            };
            if rc != ffi::CS_SUCCEED {
                return RetCode(rc);
            }
        }
        let mut rows_read: CS_INT = 0;
        // SAFETY: every column is bound to a live buffer.
        let rc = RetCode(unsafe {
            ffi::ct_fetch(
                command,
                ffi::CS_UNUSED,
                ffi::CS_UNUSED,
                ffi::CS_UNUSED,
                &raw mut rows_read,
            )
        });
        if rc == RetCode::FAIL && self.timed_out(cmd) {
            return RetCode::TIMED_OUT;
        }
        rc
    }

    fn ct_cancel(&self, target: CancelTarget, kind: CancelKind) -> RetCode {
        let (con, cmd) = match target {
            CancelTarget::Connection(con) => (con_ptr(con), ptr::null_mut()),
            CancelTarget::Command(cmd) => (ptr::null_mut(), cmd_ptr(cmd)),
        };
        // SAFETY: exactly one of the handles is set, as ct_cancel requires.
        RetCode(unsafe { ffi::ct_cancel(con, cmd, kind.code()) })
    }

    fn take_messages(&self, con: RawConnection) -> Vec<Diagnostic> {
        inbox().messages.remove(&con.as_raw()).unwrap_or_default()
    }
}

impl NativeLibrary {
    /// Whether the connection owning `cmd` reported a timeout; clears the flag.
    fn timed_out(&self, cmd: RawCommand) -> bool {
        parent(cmd).is_some_and(|con| inbox().timed_out.remove(&con))
    }
}

/// Inbox key of the connection that owns `cmd`.
fn parent(cmd: RawCommand) -> Option<usize> {
    let mut con: *mut CS_CONNECTION = ptr::null_mut();
    let size = CS_INT::try_from(std::mem::size_of::<*mut CS_CONNECTION>()).unwrap_or(8);
    // SAFETY: `con` is a pointer-sized out-buffer.
    let rc = unsafe {
        ffi::ct_cmd_props(
            cmd_ptr(cmd),
            ffi::CS_GET,
            ffi::CS_PARENT_HANDLE,
            (&raw mut con).cast(),
            size,
            ptr::null_mut(),
        )
    };
    (rc == ffi::CS_SUCCEED).then_some(con as usize)
}
