//! Low-level bindings to Open Client CT-Library and CS-Library.
//!
//! Written by hand against the 15.x `cspublic.h` / `ctpublic.h` headers and
//! limited to what the driver calls. Constants and struct layouts are always
//! compiled because the codec and the in-memory library use them; the
//! `extern` block is only linked with the `ctlib` feature.

#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]
#![allow(dead_code)]

use std::ffi::{c_char, c_void};

pub type CS_INT = i32;
pub type CS_UINT = u32;
pub type CS_SMALLINT = i16;
pub type CS_USHORT = u16;
pub type CS_BYTE = u8;
pub type CS_CHAR = c_char;
pub type CS_RETCODE = CS_INT;
pub type CS_MSGNUM = CS_INT;
pub type CS_VOID = c_void;

/// Opaque CS-Library context.
#[repr(C)]
pub struct CS_CONTEXT {
    _private: [u8; 0],
}

/// Opaque connection structure.
#[repr(C)]
pub struct CS_CONNECTION {
    _private: [u8; 0],
}

/// Opaque command structure.
#[repr(C)]
pub struct CS_COMMAND {
    _private: [u8; 0],
}

/// Opaque locale structure.
#[repr(C)]
pub struct CS_LOCALE {
    _private: [u8; 0],
}

// Return codes
pub const CS_SUCCEED: CS_RETCODE = 1;
pub const CS_FAIL: CS_RETCODE = 0;
pub const CS_MEM_ERROR: CS_RETCODE = -1;
pub const CS_PENDING: CS_RETCODE = -2;
pub const CS_QUIET: CS_RETCODE = -3;
pub const CS_BUSY: CS_RETCODE = -4;
pub const CS_INTERRUPT: CS_RETCODE = -5;
pub const CS_BLK_HAS_TEXT: CS_RETCODE = -6;
pub const CS_CONTINUE: CS_RETCODE = -7;
pub const CS_FATAL: CS_RETCODE = -8;
pub const CS_CANCELED: CS_RETCODE = -202;
pub const CS_ROW_FAIL: CS_RETCODE = -203;
pub const CS_END_DATA: CS_RETCODE = -204;
pub const CS_END_RESULTS: CS_RETCODE = -205;
pub const CS_END_ITEM: CS_RETCODE = -206;
pub const CS_NOMSG: CS_RETCODE = -207;

// Versions
pub const CS_VERSION_125: CS_INT = 12500;
pub const CS_VERSION_150: CS_INT = 15000;

// Special lengths and values
pub const CS_UNUSED: CS_INT = -99999;
pub const CS_NULLTERM: CS_INT = -9;
pub const CS_NO_LIMIT: CS_INT = -9999;
pub const CS_NO_COUNT: CS_INT = -1;

// Actions
pub const CS_GET: CS_INT = 33;
pub const CS_SET: CS_INT = 34;
pub const CS_CLEAR: CS_INT = 35;

// Properties
pub const CS_USERNAME: CS_INT = 9100;
pub const CS_PASSWORD: CS_INT = 9101;
pub const CS_APPNAME: CS_INT = 9102;
pub const CS_HOSTNAME: CS_INT = 9103;
pub const CS_TEXTLIMIT: CS_INT = 9112;
pub const CS_TIMEOUT: CS_INT = 9117;
pub const CS_PARENT_HANDLE: CS_INT = 9130;

// Callback types
pub const CS_SERVERMSG_CB: CS_INT = 2;
pub const CS_CLIENTMSG_CB: CS_INT = 3;

// ct_close / ct_exit options
pub const CS_FORCE_EXIT: CS_INT = 300;
pub const CS_FORCE_CLOSE: CS_INT = 301;

// Command types
pub const CS_LANG_CMD: CS_INT = 148;

// ct_dynamic operations
pub const CS_DEALLOC: CS_INT = 711;
pub const CS_PREPARE: CS_INT = 717;
pub const CS_EXECUTE: CS_INT = 718;
pub const CS_DESCRIBE_INPUT: CS_INT = 720;
pub const CS_DESCRIBE_OUTPUT: CS_INT = 721;

// ct_results result types
pub const CS_ROW_RESULT: CS_INT = 4040;
pub const CS_CURSOR_RESULT: CS_INT = 4041;
pub const CS_PARAM_RESULT: CS_INT = 4042;
pub const CS_STATUS_RESULT: CS_INT = 4043;
pub const CS_MSG_RESULT: CS_INT = 4044;
pub const CS_COMPUTE_RESULT: CS_INT = 4045;
pub const CS_CMD_DONE: CS_INT = 4046;
pub const CS_CMD_SUCCEED: CS_INT = 4047;
pub const CS_CMD_FAIL: CS_INT = 4048;
pub const CS_ROWFMT_RESULT: CS_INT = 4049;
pub const CS_COMPUTEFMT_RESULT: CS_INT = 4050;
pub const CS_DESCRIBE_RESULT: CS_INT = 4051;

// ct_res_info
pub const CS_ROW_COUNT: CS_INT = 800;
pub const CS_NUMDATA: CS_INT = 803;

// ct_cancel
pub const CS_CANCEL_CURRENT: CS_INT = 6000;
pub const CS_CANCEL_ALL: CS_INT = 6001;
pub const CS_CANCEL_ATTN: CS_INT = 6002;

// Datatypes
pub const CS_CHAR_TYPE: CS_INT = 0;
pub const CS_BINARY_TYPE: CS_INT = 1;
pub const CS_LONGCHAR_TYPE: CS_INT = 2;
pub const CS_LONGBINARY_TYPE: CS_INT = 3;
pub const CS_TEXT_TYPE: CS_INT = 4;
pub const CS_IMAGE_TYPE: CS_INT = 5;
pub const CS_TINYINT_TYPE: CS_INT = 6;
pub const CS_SMALLINT_TYPE: CS_INT = 7;
pub const CS_INT_TYPE: CS_INT = 8;
pub const CS_REAL_TYPE: CS_INT = 9;
pub const CS_FLOAT_TYPE: CS_INT = 10;
pub const CS_BIT_TYPE: CS_INT = 11;
pub const CS_DATETIME_TYPE: CS_INT = 12;
pub const CS_DATETIME4_TYPE: CS_INT = 13;
pub const CS_MONEY_TYPE: CS_INT = 14;
pub const CS_MONEY4_TYPE: CS_INT = 15;
pub const CS_NUMERIC_TYPE: CS_INT = 16;
pub const CS_DECIMAL_TYPE: CS_INT = 17;
pub const CS_VARCHAR_TYPE: CS_INT = 18;
pub const CS_VARBINARY_TYPE: CS_INT = 19;
pub const CS_LONG_TYPE: CS_INT = 20;
pub const CS_USHORT_TYPE: CS_INT = 24;
pub const CS_UNICHAR_TYPE: CS_INT = 25;
pub const CS_DATE_TYPE: CS_INT = 27;
pub const CS_TIME_TYPE: CS_INT = 28;
pub const CS_UNITEXT_TYPE: CS_INT = 29;
pub const CS_BIGINT_TYPE: CS_INT = 30;
pub const CS_USMALLINT_TYPE: CS_INT = 31;
pub const CS_UINT_TYPE: CS_INT = 32;
pub const CS_UBIGINT_TYPE: CS_INT = 33;
pub const CS_XML_TYPE: CS_INT = 34;
pub const CS_BIGDATETIME_TYPE: CS_INT = 35;
pub const CS_BIGTIME_TYPE: CS_INT = 36;

// CS_DATAFMT.format
pub const CS_FMT_UNUSED: CS_INT = 0x0;

// CS_DATAFMT.status bits
pub const CS_NODATA: CS_INT = 0x8;
pub const CS_UPDATABLE: CS_INT = 0x10;
pub const CS_CANBENULL: CS_INT = 0x20;
pub const CS_INPUTVALUE: CS_INT = 0x100;
pub const CS_IDENTITY: CS_INT = 0x8000;

// Sizes
pub const CS_MAX_CHAR: usize = 256;
pub const CS_MAX_MSG: usize = 1024;
pub const CS_SQLSTATE_SIZE: usize = 8;
pub const CS_MAX_NUMLEN: usize = 33;
pub const CS_MAX_PREC: u8 = 77;

// Client message severities
pub const CS_SV_RETRY_FAIL: CS_INT = 2;

/// Layer/origin/severity/number packed into a client message number.
pub const fn cs_layer(msgnumber: CS_MSGNUM) -> CS_INT {
    (msgnumber >> 24) & 0xff
}

pub const fn cs_origin(msgnumber: CS_MSGNUM) -> CS_INT {
    (msgnumber >> 16) & 0xff
}

pub const fn cs_severity(msgnumber: CS_MSGNUM) -> CS_INT {
    (msgnumber >> 8) & 0xff
}

pub const fn cs_number(msgnumber: CS_MSGNUM) -> CS_INT {
    msgnumber & 0xff
}

/// Column and parameter format descriptor.
#[repr(C)]
pub struct CS_DATAFMT {
    pub name: [CS_CHAR; CS_MAX_CHAR],
    pub namelen: CS_INT,
    pub datatype: CS_INT,
    pub format: CS_INT,
    pub maxlength: CS_INT,
    pub scale: CS_INT,
    pub precision: CS_INT,
    pub status: CS_INT,
    pub count: CS_INT,
    pub usertype: CS_INT,
    pub locale: *mut CS_LOCALE,
}

/// `CS_NUMERIC` / `CS_DECIMAL` value: sign byte then big-endian magnitude.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CS_NUMERIC {
    pub precision: CS_BYTE,
    pub scale: CS_BYTE,
    pub array: [CS_BYTE; CS_MAX_NUMLEN],
}

#[repr(C)]
pub struct CS_CLIENTMSG {
    pub severity: CS_INT,
    pub msgnumber: CS_MSGNUM,
    pub msgstring: [CS_CHAR; CS_MAX_MSG],
    pub msgstringlen: CS_INT,
    pub osnumber: CS_INT,
    pub osstring: [CS_CHAR; CS_MAX_MSG],
    pub osstringlen: CS_INT,
    pub status: CS_INT,
    pub sqlstate: [CS_BYTE; CS_SQLSTATE_SIZE],
    pub sqlstatelen: CS_INT,
}

#[repr(C)]
pub struct CS_SERVERMSG {
    pub msgnumber: CS_MSGNUM,
    pub state: CS_INT,
    pub severity: CS_INT,
    pub text: [CS_CHAR; CS_MAX_MSG],
    pub textlen: CS_INT,
    pub svrname: [CS_CHAR; CS_MAX_CHAR],
    pub svrnlen: CS_INT,
    pub proc_: [CS_CHAR; CS_MAX_CHAR],
    pub proclen: CS_INT,
    pub line: CS_INT,
    pub status: CS_INT,
    pub sqlstate: [CS_BYTE; CS_SQLSTATE_SIZE],
    pub sqlstatelen: CS_INT,
}

pub type CS_CLIENTMSG_FUNC = unsafe extern "C" fn(
    context: *mut CS_CONTEXT,
    connection: *mut CS_CONNECTION,
    message: *mut CS_CLIENTMSG,
) -> CS_RETCODE;

pub type CS_SERVERMSG_FUNC = unsafe extern "C" fn(
    context: *mut CS_CONTEXT,
    connection: *mut CS_CONNECTION,
    message: *mut CS_SERVERMSG,
) -> CS_RETCODE;

#[cfg(feature = "ctlib")]
#[link(name = "sybct64")]
#[link(name = "sybcs64")]
unsafe extern "C" {
    // Context
    pub fn cs_ctx_alloc(version: CS_INT, context: *mut *mut CS_CONTEXT) -> CS_RETCODE;
    pub fn cs_ctx_drop(context: *mut CS_CONTEXT) -> CS_RETCODE;
    pub fn ct_init(context: *mut CS_CONTEXT, version: CS_INT) -> CS_RETCODE;
    pub fn ct_exit(context: *mut CS_CONTEXT, option: CS_INT) -> CS_RETCODE;
    pub fn ct_callback(
        context: *mut CS_CONTEXT,
        connection: *mut CS_CONNECTION,
        action: CS_INT,
        cb_type: CS_INT,
        func: *mut CS_VOID,
    ) -> CS_RETCODE;

    // Connection
    pub fn ct_con_alloc(context: *mut CS_CONTEXT, connection: *mut *mut CS_CONNECTION)
    -> CS_RETCODE;
    pub fn ct_con_drop(connection: *mut CS_CONNECTION) -> CS_RETCODE;
    pub fn ct_con_props(
        connection: *mut CS_CONNECTION,
        action: CS_INT,
        property: CS_INT,
        buffer: *mut CS_VOID,
        buflen: CS_INT,
        outlen: *mut CS_INT,
    ) -> CS_RETCODE;
    pub fn ct_connect(
        connection: *mut CS_CONNECTION,
        server_name: *const CS_CHAR,
        snamelen: CS_INT,
    ) -> CS_RETCODE;
    pub fn ct_close(connection: *mut CS_CONNECTION, option: CS_INT) -> CS_RETCODE;

    // Commands
    pub fn ct_cmd_alloc(connection: *mut CS_CONNECTION, command: *mut *mut CS_COMMAND)
    -> CS_RETCODE;
    pub fn ct_cmd_drop(command: *mut CS_COMMAND) -> CS_RETCODE;
    pub fn ct_cmd_props(
        command: *mut CS_COMMAND,
        action: CS_INT,
        property: CS_INT,
        buffer: *mut CS_VOID,
        buflen: CS_INT,
        outlen: *mut CS_INT,
    ) -> CS_RETCODE;
    pub fn ct_command(
        command: *mut CS_COMMAND,
        cmd_type: CS_INT,
        buffer: *const CS_VOID,
        buflen: CS_INT,
        option: CS_INT,
    ) -> CS_RETCODE;
    pub fn ct_dynamic(
        command: *mut CS_COMMAND,
        dyn_type: CS_INT,
        id: *const CS_CHAR,
        idlen: CS_INT,
        buffer: *const CS_CHAR,
        buflen: CS_INT,
    ) -> CS_RETCODE;
    pub fn ct_param(
        command: *mut CS_COMMAND,
        datafmt: *mut CS_DATAFMT,
        data: *mut CS_VOID,
        datalen: CS_INT,
        indicator: CS_SMALLINT,
    ) -> CS_RETCODE;
    pub fn ct_send(command: *mut CS_COMMAND) -> CS_RETCODE;
    pub fn ct_results(command: *mut CS_COMMAND, result_type: *mut CS_INT) -> CS_RETCODE;
    pub fn ct_res_info(
        command: *mut CS_COMMAND,
        info_type: CS_INT,
        buffer: *mut CS_VOID,
        buflen: CS_INT,
        outlen: *mut CS_INT,
    ) -> CS_RETCODE;
    pub fn ct_describe(command: *mut CS_COMMAND, item: CS_INT, datafmt: *mut CS_DATAFMT)
    -> CS_RETCODE;
    pub fn ct_bind(
        command: *mut CS_COMMAND,
        item: CS_INT,
        datafmt: *mut CS_DATAFMT,
        buffer: *mut CS_VOID,
        copied: *mut CS_INT,
        indicator: *mut CS_SMALLINT,
    ) -> CS_RETCODE;
    pub fn ct_fetch(
        command: *mut CS_COMMAND,
        fetch_type: CS_INT,
        offset: CS_INT,
        option: CS_INT,
        rows_read: *mut CS_INT,
    ) -> CS_RETCODE;
    pub fn ct_cancel(
        connection: *mut CS_CONNECTION,
        command: *mut CS_COMMAND,
        cancel_type: CS_INT,
    ) -> CS_RETCODE;
}
