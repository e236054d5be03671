//! End-to-end behaviour of the driver over the in-memory client library.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use sqlmodel_core::error::{ConnectionErrorKind, QueryErrorKind};
use sqlmodel_core::{Connection, Decimal, Error, NullBytes, NullTime, TransactionOps, Value};

use sqlmodel_ase::mock::{MockLibrary, MockResponse, MockRows};
use sqlmodel_ase::status::Verb;
use sqlmodel_ase::{AseConnection, AseDriver, DbType};

const DSN: &str = "user=sa password=secret host=tcp:db.example:5000";

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn setup() -> (Arc<MockLibrary>, AseDriver, AseConnection) {
    let lib = Arc::new(MockLibrary::new());
    lib.set_credentials("sa", "secret");
    let driver = AseDriver::with_library(lib.clone());
    let conn = driver.open(DSN).expect("open connection");
    (lib, driver, conn)
}

#[test]
fn open_close_is_idempotent() {
    let (lib, driver, conn) = setup();
    assert_eq!(lib.connect_targets(), vec![Some("tcp:db.example:5000".to_string())]);
    assert_eq!(lib.connected_sessions(), 1);

    conn.disconnect().expect("first close");
    let err = conn.disconnect().expect_err("second close");
    assert!(
        matches!(&err, Error::Connection(c) if c.kind == ConnectionErrorKind::Closed),
        "{err:?}"
    );
    assert!(err.to_string().contains("connection is closed"));

    assert_eq!(lib.connected_sessions(), 0);
    assert_eq!(lib.live_connections(), 0);
    assert_eq!(driver.context().live_connections(), 0);
}

#[test]
fn integer_echo() {
    let (_lib, _driver, conn) = setup();
    let mut stmt = conn.prepare_statement("SELECT ?").unwrap();
    let mut cursor = stmt.query(&[Value::BigInt(42)]).unwrap();

    let row = cursor.next_row().unwrap().expect("one row");
    assert_eq!(row.len(), 1);
    assert_eq!(row.get_as::<i64>(0).unwrap(), 42);
    assert!(cursor.next_row().unwrap().is_none());
    assert!(!cursor.has_next_result_set().unwrap());
}

#[test]
fn smallmoney_round_trip() {
    let (lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE money4 (v smallmoney NULL)").unwrap();

    let samples = ["0", "0.0001", "-214748.3648", "214748.3647"];
    let mut insert = conn.prepare_statement("INSERT INTO money4 VALUES (?)").unwrap();
    for sample in samples {
        let value: Decimal = sample.parse().unwrap();
        let result = insert.exec(&[Value::Decimal(value)]).unwrap();
        assert_eq!(result.rows_affected(), 1);
    }
    insert.close().unwrap();
    assert_eq!(lib.row_count("money4"), Some(samples.len()));

    let mut select = conn.prepare_statement("SELECT * FROM money4").unwrap();
    let rows: Vec<_> = select
        .query(&[])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(rows.len(), samples.len());
    for (row, sample) in rows.iter().zip(samples) {
        let got: Decimal = row.get_as(0).unwrap();
        let want: Decimal = sample.parse().unwrap();
        assert_eq!(got.cmp_value(&want), Ordering::Equal, "sample {sample}");
        assert_eq!((got.precision(), got.scale()), (10, 4));
    }
}

#[test]
fn smallmoney_out_of_range_is_rejected() {
    let (_lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE money4 (v smallmoney NULL)").unwrap();
    let mut insert = conn.prepare_statement("INSERT INTO money4 VALUES (?)").unwrap();
    let too_big: Decimal = "214748.3648".parse().unwrap();
    let err = insert.exec(&[Value::Decimal(too_big)]).unwrap_err();
    assert!(matches!(err, Error::Query(_)), "{err:?}");
    // The statement is still usable.
    insert.exec(&[Value::Null]).unwrap();
}

#[test]
fn null_timestamp_round_trip() {
    let (_lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE events (at datetime NULL)").unwrap();
    let mut insert = conn.prepare_statement("INSERT INTO events VALUES (?)").unwrap();
    insert.exec(&[NullTime::null().value()]).unwrap();

    let mut select = conn.prepare_statement("SELECT at FROM events").unwrap();
    let row = select.query(&[]).unwrap().next_row().unwrap().unwrap();
    let mut scanned = NullTime::new(1);
    scanned.scan(row.get(0).unwrap()).unwrap();
    assert!(!scanned.valid);
    assert_eq!(select.query(&[]).unwrap().column_nullable(0), None);
}

#[test]
fn nullable_binary_round_trip() {
    let (_lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE blobs (b varbinary(16) NULL, i image NULL)").unwrap();
    let mut insert = conn.prepare_statement("INSERT INTO blobs VALUES (?, ?)").unwrap();
    let payload = vec![0x00, 0xde, 0xad, 0xbe, 0xef];
    insert
        .exec(&[NullBytes::new(payload.clone()).value(), NullBytes::null().value()])
        .unwrap();
    insert
        .exec(&[NullBytes::null().value(), NullBytes::new(vec![7; 300]).value()])
        .unwrap();

    let mut select = conn.prepare_statement("SELECT b, i FROM blobs").unwrap();
    let rows = select.query(&[]).unwrap().collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(rows.len(), 2);

    let mut scanned = NullBytes::null();
    scanned.scan(rows[0].get(0).unwrap()).unwrap();
    assert!(scanned.valid);
    assert_eq!(scanned.bytes, payload);
    scanned.scan(rows[0].get(1).unwrap()).unwrap();
    assert!(!scanned.valid);

    scanned.scan(rows[1].get(0).unwrap()).unwrap();
    assert!(!scanned.valid);
    scanned.scan(rows[1].get(1).unwrap()).unwrap();
    assert!(scanned.valid);
    assert_eq!(scanned.bytes, vec![7; 300]);
}

#[test]
fn timestamp_round_trip_keeps_datetime_precision() {
    let (_lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE events (at datetime NULL)").unwrap();
    // 2024-02-29 12:34:56.120 is representable in 1/300 s ticks.
    let at = 1_709_210_096_120_000;
    let mut insert = conn.prepare_statement("INSERT INTO events VALUES (?)").unwrap();
    insert.exec(&[NullTime::new(at).value()]).unwrap();

    let mut select = conn.prepare_statement("SELECT at FROM events").unwrap();
    let mut cursor = select.query(&[]).unwrap();
    let row = cursor.next_row().unwrap().unwrap();
    assert_eq!(cursor.column_database_type_name(0), Some("DATETIME"));
    assert_eq!(cursor.column_nullable(0), Some(true));
    let mut scanned = NullTime::null();
    scanned.scan(row.get(0).unwrap()).unwrap();
    assert!(scanned.valid);
    assert!((scanned.time - at).abs() <= 3_334, "{} vs {at}", scanned.time);
}

#[test]
fn deadline_times_out_and_connection_survives() {
    let (lib, _driver, conn) = setup();
    let mut stmt = conn.prepare_statement("WAITFOR DELAY '00:00:05'").unwrap();

    let started = Instant::now();
    let err = stmt
        .exec_with_deadline(&[], started + Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
    assert!(started.elapsed() <= Duration::from_secs(2));
    assert_eq!(lib.timeouts(), vec![Some(1), None]);
    assert_eq!(lib.call_count(Verb::Cancel), 1);

    let mut fresh = conn.prepare_statement("SELECT 1").unwrap();
    assert_eq!(fresh.query(&[]).unwrap().count(), 1);
}

#[test]
fn expired_deadline_fails_before_sending() {
    let (lib, _driver, conn) = setup();
    let mut stmt = conn.prepare_statement("SELECT 1").unwrap();
    let sends = lib.call_count(Verb::Send);
    let past = Instant::now();
    assert!(matches!(stmt.exec_with_deadline(&[], past), Err(Error::Timeout)));
    assert!(matches!(stmt.query_with_deadline(&[], past), Err(Error::Timeout)));
    assert_eq!(lib.call_count(Verb::Send), sends);
    assert!(lib.timeouts().is_empty());
}

#[test]
fn ping_honours_its_deadline() {
    let (lib, _driver, conn) = setup();
    let sends = lib.call_count(Verb::Send);
    assert!(matches!(conn.ping_with_deadline(Some(Instant::now())), Err(Error::Timeout)));
    assert_eq!(lib.call_count(Verb::Send), sends);
    assert!(lib.timeouts().is_empty());

    // Sub-second budgets round up to one second.
    conn.ping_with_deadline(Some(Instant::now() + Duration::from_millis(300)))
        .unwrap();
    assert_eq!(lib.timeouts(), vec![Some(1), None]);
}

#[test]
fn query_deadline_is_cleared_when_cursor_closes() {
    let (lib, _driver, conn) = setup();
    let mut stmt = conn.prepare_statement("SELECT 1, 2").unwrap();
    let cursor = stmt
        .query_with_deadline(&[], Instant::now() + Duration::from_secs(30))
        .unwrap();
    assert_eq!(lib.timeouts(), vec![Some(30)]);
    drop(cursor);
    assert_eq!(lib.timeouts(), vec![Some(30), None]);
}

#[test]
fn last_insert_id_is_not_supported() {
    let (_lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE t (a int NULL)").unwrap();
    let mut stmt = conn.prepare_statement("INSERT INTO t VALUES (?)").unwrap();
    let result = stmt.exec(&[Value::Int(7)]).unwrap();
    assert_eq!(result.rows_affected(), 1);
    let err = result.last_insert_id().unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
    assert!(err.to_string().contains("not supported"));
}

#[test]
fn cursor_is_forward_only() {
    let (_lib, _driver, conn) = setup();
    let mut stmt = conn.prepare_statement("SELECT 'a'").unwrap();
    let mut cursor = stmt.query(&[]).unwrap();
    assert_eq!(cursor.next_row().unwrap().unwrap().get_as::<String>(0).unwrap(), "a");
    for _ in 0..3 {
        assert!(cursor.next_row().unwrap().is_none());
    }
}

#[test]
fn early_cursor_close_leaves_connection_usable() {
    let (lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE t (a int NULL)").unwrap();
    for i in 0..5 {
        conn.execute_raw(&format!("INSERT INTO t VALUES ({i})")).unwrap();
    }
    let mut select = conn.prepare_statement("SELECT a FROM t").unwrap();
    {
        let mut cursor = select.query(&[]).unwrap();
        cursor.next_row().unwrap().unwrap();
        cursor.close().unwrap();
    }
    let mut insert = conn.prepare_statement("INSERT INTO t VALUES (?)").unwrap();
    insert.exec(&[Value::Int(9)]).unwrap();
    assert_eq!(select.query(&[]).unwrap().count(), 6);
    assert_eq!(lib.row_count("t"), Some(6));
}

#[test]
fn server_errors_carry_sql_and_code() {
    let (_lib, _driver, conn) = setup();
    let mut stmt = conn.prepare_statement("SELECT * FROM missing").unwrap();
    match stmt.query(&[]).map(|_| ()).unwrap_err() {
        Error::Query(q) => {
            assert_eq!(q.kind, QueryErrorKind::Execute);
            assert_eq!(q.sql.as_deref(), Some("SELECT * FROM missing"));
            assert_eq!(q.code, Some(208));
            assert!(q.message.starts_with("ct_results failed"), "{}", q.message);
        }
        other => panic!("unexpected {other:?}"),
    }
    // A syntax error is reported when preparing.
    match conn.prepare_statement("SELEC 1").unwrap_err() {
        Error::Query(q) => {
            assert_eq!(q.kind, QueryErrorKind::Prepare);
            assert_eq!(q.sql.as_deref(), Some("SELEC 1"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn multiple_result_sets_from_a_procedure() {
    let (lib, _driver, conn) = setup();
    lib.script(
        "exec sp_report",
        vec![
            MockResponse::Rows(
                MockRows::new()
                    .column("id", DbType::Int)
                    .row(vec![Value::Int(1)])
                    .row(vec![Value::Int(2)]),
            ),
            MockResponse::Rows(
                MockRows::new()
                    .column("total", DbType::Money)
                    .row(vec![Value::Decimal("12.5".parse().unwrap())]),
            ),
            MockResponse::Done(Some(2)),
        ],
    );
    let mut stmt = conn.prepare_statement("exec sp_report").unwrap();
    let mut cursor = stmt.query(&[]).unwrap();
    let mut sets = Vec::new();
    loop {
        let rows = cursor.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
        sets.push((cursor.columns(), rows.len()));
        if !cursor.next_result_set().unwrap() {
            break;
        }
    }
    assert_eq!(
        sets,
        vec![(vec!["id".to_string()], 2), (vec!["total".to_string()], 1)]
    );
    assert!(!cursor.has_next_result_set().unwrap());
}

#[test]
fn scripted_failure_is_reported_after_draining() {
    let (lib, _driver, conn) = setup();
    lib.script(
        "exec sp_fail",
        vec![
            MockResponse::Done(Some(3)),
            MockResponse::error("Procedure raised an error."),
            MockResponse::Done(None),
        ],
    );
    let mut stmt = conn.prepare_statement("exec sp_fail").unwrap();
    let err = stmt.exec(&[]).unwrap_err();
    assert!(err.to_string().contains("Procedure raised an error."), "{err}");
    assert_eq!(lib.live_commands(), 1);
    stmt.close().unwrap();
    assert_eq!(lib.live_commands(), 0);
}

#[test]
fn fetch_timeout_cancels_the_result_set() {
    let (lib, _driver, conn) = setup();
    lib.script(
        "exec sp_slow",
        vec![
            MockResponse::Rows(
                MockRows::new()
                    .column("id", DbType::Int)
                    .row(vec![Value::Int(1)])
                    .row(vec![Value::Int(2)])
                    .row(vec![Value::Int(3)])
                    .time_out_after(1),
            ),
            MockResponse::Done(None),
        ],
    );
    let mut stmt = conn.prepare_statement("exec sp_slow").unwrap();
    let mut cursor = stmt
        .query_with_deadline(&[], Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(cursor.next_row().unwrap().unwrap().get_as::<i32>(0).unwrap(), 1);
    let err = cursor.next_row().unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
    assert!(cursor.next_row().unwrap().is_none());
    assert!(!cursor.has_next_result_set().unwrap());
    drop(cursor);
    assert_eq!(lib.timeouts(), vec![Some(5), None]);

    let mut fresh = conn.prepare_statement("SELECT 1").unwrap();
    assert_eq!(fresh.query(&[]).unwrap().count(), 1);
}

#[test]
fn deadlock_victim_is_retryable() {
    let (lib, _driver, conn) = setup();
    lib.script(
        "exec sp_transfer",
        vec![
            MockResponse::Error {
                number: 1205,
                severity: 13,
                message: "Your server command (family id #0, process id #23) encountered a deadlock situation. Please re-run your command.".to_string(),
            },
            MockResponse::Done(None),
        ],
    );
    let mut stmt = conn.prepare_statement("exec sp_transfer").unwrap();
    let err = stmt.exec(&[]).unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
    match err {
        Error::Query(q) => {
            assert_eq!(q.kind, QueryErrorKind::Deadlock);
            assert_eq!(q.code, Some(1205));
            assert_eq!(q.sql.as_deref(), Some("exec sp_transfer"));
        }
        other => panic!("unexpected {other:?}"),
    }
    conn.ping_with_deadline(None).unwrap();
}

// ==================== Connection trait ====================

#[test]
fn connection_trait_round_trip() {
    let (lib, _driver, conn) = setup();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        unwrap_outcome(
            conn.execute(&cx, "CREATE TABLE heroes (id int IDENTITY, name varchar(30) NOT NULL)", &[])
                .await,
        );
        let first = unwrap_outcome(
            conn.insert(&cx, "INSERT INTO heroes (name) VALUES (?)", &[Value::Text("Ada".into())])
                .await,
        );
        let second = unwrap_outcome(
            conn.insert(&cx, "INSERT INTO heroes (name) VALUES (?)", &[Value::Text("Grace".into())])
                .await,
        );
        assert_eq!((first, second), (1, 2));

        let rows = unwrap_outcome(conn.query(&cx, "SELECT id, name FROM heroes", &[]).await);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_named::<String>("name").unwrap(), "Grace");

        let one = unwrap_outcome(conn.query_one(&cx, "SELECT name FROM heroes", &[]).await);
        assert_eq!(one.unwrap().get_as::<String>(0).unwrap(), "Ada");

        let counts = unwrap_outcome(
            conn.batch(
                &cx,
                &[
                    ("INSERT INTO heroes (name) VALUES (?)".to_string(), vec![Value::Text("Linus".into())]),
                    ("DELETE FROM heroes".to_string(), vec![]),
                ],
            )
            .await,
        );
        assert_eq!(counts, vec![1, 3]);

        unwrap_outcome(conn.ping(&cx).await);
        assert!(conn.is_valid(&cx).await);
    });

    // Every statement the trait prepared was deallocated again.
    assert_eq!(lib.live_commands(), 0);
    assert_eq!(lib.prepared().len(), lib.deallocations().len());
}

#[test]
fn connection_trait_prepare_validates() {
    let (lib, _driver, conn) = setup();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let stmt = unwrap_outcome(conn.prepare(&cx, "SELECT ?").await);
        assert_eq!(stmt.sql(), "SELECT ?");
        assert_eq!(stmt.param_count(), None);
        let rows = unwrap_outcome(conn.query_prepared(&cx, &stmt, &[Value::Int(5)]).await);
        assert_eq!(rows[0].get_as::<i64>(0).unwrap(), 5);

        match conn.prepare(&cx, "SELEC ?").await {
            Outcome::Err(Error::Query(q)) => assert_eq!(q.kind, QueryErrorKind::Prepare),
            other => panic!("expected prepare error, got {other:?}"),
        }
    });
    assert_eq!(lib.live_commands(), 0);
}

#[test]
fn connection_trait_transactions() {
    let (lib, _driver, conn) = setup();
    conn.execute_raw("CREATE TABLE t (a int NULL)").unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();

    rt.block_on(async {
        let tx = unwrap_outcome(conn.begin(&cx).await);
        unwrap_outcome(tx.execute(&cx, "INSERT INTO t VALUES (?)", &[Value::Int(1)]).await);
        unwrap_outcome(tx.savepoint(&cx, "one").await);
        unwrap_outcome(tx.execute(&cx, "INSERT INTO t VALUES (?)", &[Value::Int(2)]).await);
        unwrap_outcome(tx.rollback_to(&cx, "one").await);
        let rows = unwrap_outcome(tx.query(&cx, "SELECT a FROM t", &[]).await);
        assert_eq!(rows.len(), 1);
        unwrap_outcome(tx.commit(&cx).await);

        let tx = unwrap_outcome(
            conn.begin_with(&cx, sqlmodel_core::IsolationLevel::RepeatableRead)
                .await,
        );
        unwrap_outcome(tx.execute(&cx, "INSERT INTO t VALUES (?)", &[Value::Int(3)]).await);
        unwrap_outcome(tx.rollback(&cx).await);
    });

    assert_eq!(lib.row_count("t"), Some(1));
    let sent = lib.language_commands();
    assert!(sent.contains(&"COMMIT TRANSACTION".to_string()));
    assert!(sent.contains(&"SET TRANSACTION ISOLATION LEVEL 2".to_string()));
    assert_eq!(sent.last().map(String::as_str), Some("ROLLBACK TRANSACTION"));
}

#[test]
fn connection_trait_close() {
    let (lib, _driver, conn) = setup();
    let _stmt = conn.prepare_statement("SELECT 1").unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        Connection::close(conn, &cx).await.expect("close");
    });
    assert_eq!(lib.connected_sessions(), 0);
    assert_eq!(lib.deallocations(), vec!["dyn1".to_string()]);
}

// ==================== Resource accounting ====================

fn assert_no_leaks(lib: &MockLibrary, driver: &AseDriver) {
    assert_eq!(lib.live_connections(), 0, "connection handles");
    assert_eq!(lib.connected_sessions(), 0, "open sessions");
    assert_eq!(lib.live_commands(), 0, "command handles");
    assert_eq!(driver.context().live_connections(), 0, "context leases");
}

#[test]
fn every_prepare_is_deallocated_once() {
    let (lib, driver, conn) = setup();
    conn.execute_raw("CREATE TABLE t (a int NULL)").unwrap();
    for i in 0..10 {
        let mut stmt = conn.prepare_statement("INSERT INTO t VALUES (?)").unwrap();
        stmt.exec(&[Value::Int(i)]).unwrap();
        if i % 2 == 0 {
            stmt.close().unwrap();
        }
    }
    let mut select = conn.prepare_statement("SELECT a FROM t").unwrap();
    let cursor = select.query(&[]).unwrap();
    drop(cursor);
    drop(select);
    assert_eq!(lib.live_commands(), 0);
    assert_eq!(lib.prepared().len(), 11);
    assert_eq!(lib.deallocations().len(), 11);

    let _open = conn.prepare_statement("SELECT 1").unwrap();
    conn.disconnect().unwrap();
    assert_eq!(lib.deallocations().len(), 12);
    assert_no_leaks(&lib, &driver);
}

#[test]
fn failed_deallocation_can_be_retried() {
    let (lib, driver, conn) = setup();
    let mut stmt = conn.prepare_statement("SELECT 1").unwrap();
    assert_eq!(stmt.name(), "dyn1");

    lib.fail_next(Verb::Dynamic);
    assert!(stmt.close().is_err());
    assert_eq!(lib.live_commands(), 1);
    assert!(lib.deallocations().is_empty());

    stmt.close().unwrap();
    assert_eq!(lib.deallocations(), vec!["dyn1".to_string()]);
    assert_eq!(lib.live_commands(), 0);
    stmt.close().unwrap();
    assert_eq!(lib.deallocations().len(), 1);

    // The released name is reused.
    let next = conn.prepare_statement("SELECT 2").unwrap();
    assert_eq!(next.name(), "dyn1");
    drop(next);
    conn.disconnect().unwrap();
    assert_no_leaks(&lib, &driver);
}

#[test]
fn failed_open_steps_release_everything() {
    for verb in [Verb::ConAlloc, Verb::ConProps, Verb::TextLimit, Verb::Connect] {
        let lib = Arc::new(MockLibrary::new());
        let driver = AseDriver::with_library(lib.clone());
        lib.fail_next(verb);
        let err = driver.open(DSN).unwrap_err();
        assert!(
            err.to_string().contains(verb.name()),
            "{verb:?}: {err}"
        );
        assert_no_leaks(&lib, &driver);

        // The next attempt succeeds.
        let conn = driver.open(DSN).unwrap();
        conn.disconnect().unwrap();
        assert_no_leaks(&lib, &driver);
    }
}

#[test]
fn context_allocation_failure_is_sticky() {
    let lib = Arc::new(MockLibrary::new());
    let driver = AseDriver::with_library(lib.clone());
    lib.fail_next(Verb::CtxAlloc);
    let first = driver.open(DSN).unwrap_err();
    assert!(first.to_string().contains("cs_ctx_alloc failed"), "{first}");
    let second = driver.open(DSN).unwrap_err();
    assert!(second.to_string().contains("cs_ctx_alloc failed"), "{second}");
    assert_eq!(lib.call_count(Verb::CtxAlloc), 1);
    assert_eq!(lib.live_contexts(), 0);
}

#[test]
fn login_failure_is_an_authentication_error() {
    let lib = Arc::new(MockLibrary::new());
    lib.set_credentials("sa", "right");
    let driver = AseDriver::with_library(lib.clone());
    let err = driver.open("user=sa password=wrong").unwrap_err();
    match &err {
        Error::Connection(c) => {
            assert_eq!(c.kind, ConnectionErrorKind::Authentication);
            assert!(c.message.contains("Login failed."), "{}", c.message);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_no_leaks(&lib, &driver);
}

#[test]
fn unknown_database_fails_the_open() {
    let lib = Arc::new(MockLibrary::new());
    lib.set_databases(&["pubs2"]);
    let driver = AseDriver::with_library(lib.clone());

    let err = driver.open("user=sa password=x database=nope").unwrap_err();
    assert!(
        matches!(&err, Error::Connection(c) if c.kind == ConnectionErrorKind::Connect),
        "{err:?}"
    );
    assert!(err.to_string().contains("sysdatabases"), "{err}");
    assert_no_leaks(&lib, &driver);

    let conn = driver.open("user=sa password=x database=pubs2").unwrap();
    assert_eq!(lib.databases_in_use(), vec!["pubs2".to_string()]);
    drop(conn);
    assert_no_leaks(&lib, &driver);
}

#[test]
fn shutdown_waits_for_open_connections() {
    let (lib, driver, conn) = setup();
    assert!(matches!(driver.context().shutdown(), Err(Error::Custom(_))));
    conn.disconnect().unwrap();
    driver.context().shutdown().unwrap();
    driver.context().shutdown().unwrap();
    assert_eq!(lib.live_contexts(), 0);
    assert!(driver.open(DSN).is_err());
}

#[test]
fn failed_context_drop_is_retried_without_exiting_again() {
    let (lib, driver, conn) = setup();
    conn.disconnect().unwrap();
    lib.fail_next(Verb::CtxDrop);
    assert!(driver.context().shutdown().is_err());
    assert!(driver.open(DSN).is_err());

    driver.context().shutdown().unwrap();
    assert_eq!(lib.call_count(Verb::Exit), 1);
    assert_eq!(lib.live_contexts(), 0);
}
