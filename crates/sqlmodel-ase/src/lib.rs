//! Sybase ASE driver for SQLModel Rust.
//!
//! This crate talks to Adaptive Server Enterprise through Open Client
//! CT-Library. It implements the `Connection` trait from sqlmodel-core and
//! also exposes the CT-Library model directly: prepared (dynamic) statements
//! with lazy row cursors, multiple result sets and per-call deadlines.
//!
//! # Features
//!
//! - `ctlib`: link `libsybct64` / `libsybcs64` and use them through
//!   [`ContextManager::global`]. Without it, connections are opened over a
//!   [`ClientLibrary`] supplied by the caller.
//! - `mock`: build `mock::MockLibrary`, an in-memory client library with a
//!   small SQL engine, for tests of code that uses the driver.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlmodel_ase::AseDriver;
//! use sqlmodel_core::Value;
//!
//! let driver = AseDriver::new();
//! let conn = driver.open("user=sa password=secret host=SYBASE database=pubs2")?;
//!
//! let mut stmt = conn.prepare_statement("SELECT title FROM titles WHERE price > ?")?;
//! for row in stmt.query(&[Value::Double(20.0)])? {
//!     println!("{}", row?.get_as::<String>(0)?);
//! }
//! stmt.close()?;
//! conn.disconnect()?;
//! ```
//!
//! # Type Mapping
//!
//! | ASE type | `Value` |
//! |----------|---------|
//! | `tinyint`, `smallint`, `int`, `bigint` (and unsigned) | `BigInt` |
//! | `bit` | `Bool` |
//! | `real`, `float` | `Double` |
//! | `numeric`, `decimal`, `money`, `smallmoney` | `Decimal` |
//! | `char`, `varchar`, `text`, `unichar`, `unitext` | `Text` |
//! | `binary`, `varbinary`, `image` | `Bytes` |
//! | `datetime`, `smalldatetime`, `date`, `time`, `bigdatetime`, `bigtime` | `Timestamp` (µs since the Unix epoch; times fall on 1900-01-01) |
//!
//! # Thread Safety
//!
//! A connection and the statements prepared on it share one mutex-guarded
//! session, so they may move between threads. Connections are independent
//! of each other and share only the process-wide context.

pub mod config;
pub mod connection;
pub mod context;
pub mod ffi;
pub mod library;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
#[cfg(feature = "ctlib")]
pub mod native;
pub mod result;
pub mod rows;
pub mod statement;
pub mod status;
pub mod transaction;
pub mod types;

pub use config::{AseConfig, DEFAULT_TEXT_LIMIT, DsnInfo, parse_dsn};
pub use connection::{AseConnection, AseDriver, DRIVER_NAME, register};
pub use context::ContextManager;
pub use library::ClientLibrary;
pub use result::ExecResult;
pub use rows::RowCursor;
pub use statement::AseStatement;
pub use transaction::AseTransaction;
pub use types::{DbType, ScanType};
