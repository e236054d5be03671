//! Process-wide driver registry.
//!
//! Drivers register under a short name (`"ase"`, ...) and are opened by
//! name with a driver-specific DSN:
//!
//! ```rust,ignore
//! sqlmodel_ase::register()?;
//! let conn: AseConnection = sqlmodel_core::driver::open("ase", "user=sa password=secret")?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::connection::Connection;
use crate::error::{Error, Result, TypeError};

/// A database driver that opens connections from a DSN string.
pub trait Driver: Send + Sync + 'static {
    /// Connection type produced by [`Driver::open`].
    type Connection: Connection + 'static;

    /// Registry name.
    fn name(&self) -> &'static str;

    /// Open a new connection.
    fn open(&self, dsn: &str) -> Result<Self::Connection>;
}

trait ErasedDriver: Send + Sync {
    fn open_any(&self, dsn: &str) -> Result<Box<dyn Any + Send>>;
    fn connection_type(&self) -> &'static str;
}

impl<D: Driver> ErasedDriver for D {
    fn open_any(&self, dsn: &str) -> Result<Box<dyn Any + Send>> {
        let conn = Driver::open(self, dsn)?;
        Ok(Box::new(conn))
    }

    fn connection_type(&self) -> &'static str {
        std::any::type_name::<D::Connection>()
    }
}

type Registry = RwLock<HashMap<&'static str, Arc<dyn ErasedDriver>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register a driver under [`Driver::name`].
///
/// Registering a second driver under a taken name is an error.
pub fn register<D: Driver>(driver: D) -> Result<()> {
    let name = driver.name();
    let mut drivers = registry().write().unwrap_or_else(PoisonError::into_inner);
    if drivers.contains_key(name) {
        return Err(Error::config(format!(
            "driver '{name}' is already registered"
        )));
    }
    drivers.insert(name, Arc::new(driver));
    tracing::debug!(driver = name, "registered database driver");
    Ok(())
}

/// Is a driver registered under `name`?
pub fn is_registered(name: &str) -> bool {
    registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(name)
}

/// Names of all registered drivers, sorted.
pub fn drivers() -> Vec<&'static str> {
    let mut names: Vec<_> = registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .copied()
        .collect();
    names.sort_unstable();
    names
}

/// Open a connection through the driver registered as `name`.
///
/// `C` must be the driver's connection type.
pub fn open<C: 'static>(name: &str, dsn: &str) -> Result<C> {
    let driver = registry()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or_else(|| Error::config(format!("unknown driver '{name}'")))?;

    let conn = driver.open_any(dsn)?;
    conn.downcast::<C>().map(|boxed| *boxed).map_err(|_| {
        Error::Type(TypeError {
            expected: driver.connection_type(),
            actual: std::any::type_name::<C>().to_string(),
            column: None,
            rust_type: Some(std::any::type_name::<C>()),
        })
    })
}
