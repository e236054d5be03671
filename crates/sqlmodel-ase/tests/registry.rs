//! Opening connections through the process-wide driver registry.
//!
//! The registry is global, so everything runs in one test.

use std::sync::Arc;

use sqlmodel_core::{Error, driver};

use sqlmodel_ase::mock::MockLibrary;
use sqlmodel_ase::{AseConnection, AseDriver, DRIVER_NAME};

#[test]
fn open_by_driver_name() {
    let lib = Arc::new(MockLibrary::new());
    driver::register(AseDriver::with_library(lib.clone())).expect("register mock driver");
    assert!(driver::is_registered(DRIVER_NAME));
    assert!(driver::drivers().contains(&DRIVER_NAME));

    // Already registered: a no-op, and the mock-backed driver stays in place.
    sqlmodel_ase::register().expect("register is idempotent");
    let err = driver::register(AseDriver::with_library(lib.clone())).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err:?}");

    let conn: AseConnection = driver::open(DRIVER_NAME, "user=sa password=x host=SYBASE").unwrap();
    assert_eq!(lib.connect_targets(), vec![Some("SYBASE".to_string())]);
    conn.ping_with_deadline(None).unwrap();
    conn.disconnect().unwrap();
    assert_eq!(lib.live_connections(), 0);

    // Asking for the wrong connection type opens, then drops, the connection.
    let err = driver::open::<String>(DRIVER_NAME, "user=sa password=x").unwrap_err();
    assert!(matches!(err, Error::Type(_)), "{err:?}");
    assert_eq!(lib.live_connections(), 0);

    assert!(driver::open::<AseConnection>("nope", "user=sa").is_err());
    assert!(driver::open::<AseConnection>(DRIVER_NAME, "user=sa port=banana").is_err());
}
