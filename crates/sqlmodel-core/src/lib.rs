//! Core types and traits for SQLModel Rust.
//!
//! - `Connection` / `TransactionOps` traits implemented by drivers
//! - `Value`, `Decimal` and `Row` for parameters and results
//! - `driver` registry for opening connections by driver name
//! - `NullTime` / `NullBytes` nullable scan targets
//! - `Outcome` and `Cx` re-exported from asupersync

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod connection;
pub mod decimal;
pub mod driver;
pub mod error;
pub mod nullable;
pub mod row;
pub mod value;

pub use connection::{Connection, IsolationLevel, PreparedStatement, TransactionOps};
pub use decimal::Decimal;
pub use driver::Driver;
pub use error::{Error, Result};
pub use nullable::{NullBytes, NullTime};
pub use row::{ColumnInfo, FromValue, Row};
pub use value::Value;
