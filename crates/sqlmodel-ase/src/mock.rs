//! An in-memory [`ClientLibrary`] for tests.
//!
//! `MockLibrary` behaves like CT-Library talking to a tiny server. It hands
//! out handles and keeps count of the live ones, records every call, and
//! enforces the ordering rules the real library checks (no `ct_send` while
//! another command has pending results, no `ct_con_drop` before `ct_close`,
//! no `ct_exit` while connections exist, ...).
//!
//! The server understands a small SQL subset:
//!
//! - `CREATE TABLE t (col type [IDENTITY] [NULL | NOT NULL], ...)`, `DROP TABLE t`
//! - `INSERT INTO t [(cols)] VALUES (?, 1, 'x', NULL, ...)`
//! - `SELECT * FROM t`, `SELECT a, b FROM t`, `DELETE FROM t`
//! - `SELECT ?, 1, 'x'`, `SELECT @@identity`
//! - `WAITFOR DELAY 'hh:mm:ss'`, which times out when the connection has a
//!   shorter timeout configured
//! - `BEGIN`, `COMMIT`, `ROLLBACK` and `SAVE TRANSACTION`, with rollback
//!   restoring table contents
//! - `SET TRANSACTION ISOLATION LEVEL n`, `USE db`
//!
//! Any other text fails with a syntax error unless a response was scripted
//! for it with [`MockLibrary::script`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ffi::CStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use sqlmodel_core::{Decimal, Value};

use crate::ffi;
use crate::library::{
    CancelKind, CancelTarget, ClientLibrary, CloseOption, ColumnBuffer, ConProperty, DataFormat,
    DynamicOp, RawCommand, RawConnection, RawContext, ResInfo, ResultType,
};
use crate::status::{Diagnostic, RetCode, Verb};
use crate::types::{self, DbType};

/// A scripted server response.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// A result set.
    Rows(MockRows),
    /// Command completion with an optional row count.
    Done(Option<i32>),
    /// A server error message followed by `CS_CMD_FAIL`.
    Error {
        number: i32,
        severity: i32,
        message: String,
    },
    /// The network read times out.
    TimedOut,
}

impl MockResponse {
    /// A user-level server error (message 50000, severity 16).
    pub fn error(message: impl Into<String>) -> Self {
        MockResponse::Error {
            number: 50000,
            severity: 16,
            message: message.into(),
        }
    }
}

/// Builder for a scripted result set.
#[derive(Debug, Clone, Default)]
pub struct MockRows {
    columns: Vec<DataFormat>,
    rows: Vec<Vec<Value>>,
    timeout_after: Option<usize>,
}

impl MockRows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a nullable column with the default format for `datatype`.
    #[must_use]
    pub fn column(self, name: &str, datatype: DbType) -> Self {
        self.format(default_format(datatype).named(name).nullable(true))
    }

    /// Add a column with an explicit format.
    #[must_use]
    pub fn format(mut self, format: DataFormat) -> Self {
        self.columns.push(format);
        self
    }

    #[must_use]
    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    /// Time the network read out once `rows` rows were fetched.
    #[must_use]
    pub fn time_out_after(mut self, rows: usize) -> Self {
        self.timeout_after = Some(rows);
        self
    }
}

fn default_format(datatype: DbType) -> DataFormat {
    let len = datatype
        .fixed_size()
        .and_then(|n| i32::try_from(n).ok())
        .unwrap_or(255);
    let format = DataFormat::new(datatype, len);
    match datatype {
        DbType::Numeric | DbType::Decimal => format.with_precision(18, 0),
        _ => format,
    }
}

type Cell = Option<Vec<u8>>;

#[derive(Debug, Clone)]
struct ResultSet {
    formats: Vec<DataFormat>,
    rows: VecDeque<Vec<Cell>>,
    timeout_after: Option<usize>,
}

#[derive(Debug, Clone)]
enum Event {
    Rows(ResultSet),
    Succeed,
    Done(Option<i32>),
    Fail(Diagnostic),
    TimedOut,
}

type Events = VecDeque<Event>;

fn fail(number: i32, severity: i32, message: impl Into<String>) -> Events {
    VecDeque::from([Event::Fail(Diagnostic::server(number, severity, message))])
}

fn succeeded() -> Events {
    VecDeque::from([Event::Succeed, Event::Done(None)])
}

#[derive(Debug, Clone)]
struct TableColumn {
    format: DataFormat,
    identity: bool,
}

#[derive(Debug, Clone, Default)]
struct Table {
    columns: Vec<TableColumn>,
    rows: Vec<Vec<Cell>>,
    next_identity: i64,
}

type Tables = BTreeMap<String, Table>;

#[derive(Debug, Clone)]
enum Initiated {
    Language(String),
    Dynamic {
        op: DynamicOp,
        name: String,
        text: Option<String>,
    },
}

#[derive(Debug, Default)]
struct MockCommand {
    con: usize,
    initiated: Option<Initiated>,
    params: Vec<Value>,
    events: Events,
    current: Option<ResultSet>,
    row_count: Option<i32>,
}

#[derive(Debug, Default)]
struct MockSession {
    ctx: usize,
    props: HashMap<ConProperty, String>,
    connected: bool,
    timeout: Option<i32>,
    text_limit: Option<i32>,
    messages: Vec<Diagnostic>,
    dynamic: HashMap<String, String>,
    busy: Option<usize>,
    database: Option<String>,
    isolation: Option<u8>,
    tran_count: u32,
    snapshot: Option<Tables>,
    savepoints: Vec<(String, Tables)>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: usize,
    contexts: BTreeMap<usize, bool>,
    sessions: BTreeMap<usize, MockSession>,
    commands: BTreeMap<usize, MockCommand>,
    failures: Vec<(Verb, RetCode)>,
    credentials: Option<(String, String)>,
    databases: Option<BTreeSet<String>>,
    scripts: HashMap<String, Vec<MockResponse>>,
    tables: Tables,
    identity: i64,
    calls: Vec<&'static str>,
    language: Vec<String>,
    prepared: Vec<String>,
    deallocated: Vec<String>,
    timeouts: Vec<Option<i32>>,
    last_params: Vec<Value>,
    connect_targets: Vec<Option<String>>,
}

/// Scripted in-memory CT-Library.
#[derive(Debug, Default)]
pub struct MockLibrary {
    state: Mutex<MockState>,
}

impl MockLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Only accept logins with these credentials.
    pub fn set_credentials(&self, username: &str, password: &str) {
        self.state().credentials = Some((username.to_string(), password.to_string()));
    }

    /// Only accept `USE` for these database names.
    pub fn set_databases(&self, names: &[&str]) {
        self.state().databases = Some(names.iter().map(|n| n.to_string()).collect());
    }

    /// Make the next call of `verb` fail with `CS_FAIL`.
    pub fn fail_next(&self, verb: Verb) {
        self.fail_next_with(verb, RetCode::FAIL);
    }

    /// Make the next call of `verb` return `rc`.
    pub fn fail_next_with(&self, verb: Verb, rc: RetCode) {
        self.state().failures.push((verb, rc));
    }

    /// Answer `sql` (matched after trimming) with `responses` on every execution.
    pub fn script(&self, sql: &str, responses: Vec<MockResponse>) {
        self.state()
            .scripts
            .insert(normalize(sql).to_string(), responses);
    }

    pub fn live_contexts(&self) -> usize {
        self.state().contexts.len()
    }

    pub fn live_connections(&self) -> usize {
        self.state().sessions.len()
    }

    /// Connections currently logged in to the server.
    pub fn connected_sessions(&self) -> usize {
        self.state().sessions.values().filter(|s| s.connected).count()
    }

    pub fn live_commands(&self) -> usize {
        self.state().commands.len()
    }

    /// Every native routine called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, verb: Verb) -> usize {
        let name = verb.name();
        self.state().calls.iter().filter(|c| **c == name).count()
    }

    /// Language command texts, in order.
    pub fn language_commands(&self) -> Vec<String> {
        self.state().language.clone()
    }

    /// Statement names successfully prepared, in order.
    pub fn prepared(&self) -> Vec<String> {
        self.state().prepared.clone()
    }

    /// Statement names successfully deallocated, in order.
    pub fn deallocations(&self) -> Vec<String> {
        self.state().deallocated.clone()
    }

    /// Every timeout set through `ct_timeout`, in order.
    pub fn timeouts(&self) -> Vec<Option<i32>> {
        self.state().timeouts.clone()
    }

    /// Text limit of each live connection that set one.
    pub fn text_limits(&self) -> Vec<i32> {
        self.state()
            .sessions
            .values()
            .filter_map(|s| s.text_limit)
            .collect()
    }

    /// Parameters of the most recent dynamic execute.
    pub fn last_params(&self) -> Vec<Value> {
        self.state().last_params.clone()
    }

    /// Server names passed to `ct_connect`; `None` for the directory default.
    pub fn connect_targets(&self) -> Vec<Option<String>> {
        self.state().connect_targets.clone()
    }

    /// Property values set on live connections.
    pub fn property(&self, property: ConProperty) -> Vec<String> {
        self.state()
            .sessions
            .values()
            .filter_map(|s| s.props.get(&property).cloned())
            .collect()
    }

    /// Current database of each live connection that ran `USE`.
    pub fn databases_in_use(&self) -> Vec<String> {
        self.state()
            .sessions
            .values()
            .filter_map(|s| s.database.clone())
            .collect()
    }

    /// Rows currently stored in `table`.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.state()
            .tables
            .get(&table.to_ascii_lowercase())
            .map(|t| t.rows.len())
    }
}

impl MockState {
    fn enter(&mut self, verb: Verb) -> Option<RetCode> {
        self.calls.push(verb.name());
        let index = self.failures.iter().position(|(v, _)| *v == verb)?;
        Some(self.failures.remove(index).1)
    }

    fn allocate(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle
    }

    fn client_message(&mut self, con: usize, text: String) {
        if let Some(session) = self.sessions.get_mut(&con) {
            session.messages.push(Diagnostic::client(0, 1, text));
        }
    }

    fn injected_on_con(&mut self, verb: Verb, con: usize) -> Option<RetCode> {
        let rc = self.enter(verb)?;
        self.client_message(con, format!("{verb}(): injected failure"));
        Some(rc)
    }

    fn injected_on_cmd(&mut self, verb: Verb, cmd: usize) -> Option<RetCode> {
        let rc = self.enter(verb)?;
        if let Some(con) = self.commands.get(&cmd).map(|c| c.con) {
            self.client_message(con, format!("{verb}(): injected failure"));
        }
        Some(rc)
    }

    fn clear_command(&mut self, cmd: usize) {
        if let Some(command) = self.commands.get_mut(&cmd) {
            command.events.clear();
            command.current = None;
            let con = command.con;
            if let Some(session) = self.sessions.get_mut(&con) {
                if session.busy == Some(cmd) {
                    session.busy = None;
                }
            }
        }
    }

    fn rollback_session(&mut self, con: usize) {
        let Some(session) = self.sessions.get_mut(&con) else {
            return;
        };
        session.tran_count = 0;
        session.savepoints.clear();
        if let Some(snapshot) = session.snapshot.take() {
            self.tables = snapshot;
        }
    }

    fn run(&mut self, cmd: usize) -> Events {
        let Some(command) = self.commands.get_mut(&cmd) else {
            return VecDeque::new();
        };
        let con = command.con;
        let params = std::mem::take(&mut command.params);
        let Some(initiated) = command.initiated.take() else {
            return VecDeque::new();
        };

        match initiated {
            Initiated::Language(text) => {
                self.language.push(text.clone());
                self.execute_sql(con, &text, &[])
            }
            Initiated::Dynamic { op, name, text } => match op {
                DynamicOp::Prepare => self.prepare(con, name, text.unwrap_or_default()),
                DynamicOp::Execute => {
                    let sql = self
                        .sessions
                        .get(&con)
                        .and_then(|s| s.dynamic.get(&name).cloned());
                    let Some(sql) = sql else {
                        return fail(7857, 16, format!("Dynamic statement '{name}' not found."));
                    };
                    let expected = placeholder_count(&sql);
                    if expected != params.len() {
                        return fail(
                            201,
                            16,
                            format!(
                                "Statement '{name}' expects {expected} parameters, {} supplied.",
                                params.len()
                            ),
                        );
                    }
                    self.last_params.clone_from(&params);
                    self.execute_sql(con, &sql, &params)
                }
                DynamicOp::Deallocate => {
                    let removed = self
                        .sessions
                        .get_mut(&con)
                        .and_then(|s| s.dynamic.remove(&name));
                    if removed.is_none() {
                        return fail(7857, 16, format!("Dynamic statement '{name}' not found."));
                    }
                    self.deallocated.push(name);
                    succeeded()
                }
            },
        }
    }

    fn prepare(&mut self, con: usize, name: String, sql: String) -> Events {
        if self
            .sessions
            .get(&con)
            .is_some_and(|s| s.dynamic.contains_key(&name))
        {
            return fail(
                7856,
                16,
                format!("Dynamic statement '{name}' already exists."),
            );
        }
        if !self.scripts.contains_key(normalize(&sql)) {
            if let Err(diag) = parse(&sql) {
                return VecDeque::from([Event::Fail(diag)]);
            }
        }
        if let Some(session) = self.sessions.get_mut(&con) {
            session.dynamic.insert(name.clone(), sql);
        }
        self.prepared.push(name);
        succeeded()
    }

    fn execute_sql(&mut self, con: usize, sql: &str, params: &[Value]) -> Events {
        if let Some(responses) = self.scripts.get(normalize(sql)).cloned() {
            return scripted(&responses);
        }
        match parse(sql) {
            Ok(statement) => self.apply(con, statement, params),
            Err(diag) => VecDeque::from([Event::Fail(diag)]),
        }
    }

    fn apply(&mut self, con: usize, statement: Statement, params: &[Value]) -> Events {
        let mut params = params.iter();
        let mut resolve = |item: &Item| -> Option<Value> {
            Some(match item {
                Item::Param => params.next()?.clone(),
                Item::Int(v) => Value::BigInt(*v),
                Item::Str(s) => Value::Text(s.clone()),
                Item::Null => Value::Null,
                Item::Ident(_) => return None,
            })
        };

        match statement {
            Statement::Select(items) => {
                let mut formats = Vec::with_capacity(items.len());
                let mut row = Vec::with_capacity(items.len());
                for item in &items {
                    let Some(value) = resolve(item) else {
                        return fail(102, 15, "Incorrect syntax near '?'.");
                    };
                    let format = match (&value, item) {
                        (Value::Null, _) => DataFormat::new(DbType::Int, 4),
                        (Value::BigInt(v), Item::Int(_)) if i32::try_from(*v).is_ok() => {
                            DataFormat::new(DbType::Int, 4)
                        }
                        (value, _) => match types::encode_param(value) {
                            Ok((format, _)) => format,
                            Err(e) => return fail(257, 16, e.to_string()),
                        },
                    };
                    let format = DataFormat {
                        status: 0,
                        ..format
                    }
                    .nullable(true);
                    row.push(if value.is_null() {
                        None
                    } else {
                        match types::encode(&value, &format) {
                            Ok(bytes) => Some(bytes),
                            Err(e) => return fail(257, 16, e.to_string()),
                        }
                    });
                    formats.push(format);
                }
                rows_then_done(formats, vec![row])
            }
            Statement::Identity => {
                let format = DataFormat::new(DbType::Numeric, 35).with_precision(38, 0);
                let cell = Decimal::new(i128::from(self.identity), 38, 0)
                    .ok()
                    .and_then(|d| types::encode(&Value::Decimal(d), &format).ok());
                rows_then_done(vec![format], vec![vec![cell]])
            }
            Statement::SelectFrom { table, columns } => {
                let Some(t) = self.tables.get(&table) else {
                    return not_found(&table);
                };
                let indexes: Vec<usize> = match &columns {
                    None => (0..t.columns.len()).collect(),
                    Some(names) => {
                        let mut indexes = Vec::with_capacity(names.len());
                        for name in names {
                            match t
                                .columns
                                .iter()
                                .position(|c| c.format.name.eq_ignore_ascii_case(name))
                            {
                                Some(i) => indexes.push(i),
                                None => return fail(207, 16, format!("Invalid column name '{name}'.")),
                            }
                        }
                        indexes
                    }
                };
                let formats = indexes.iter().map(|&i| t.columns[i].format.clone()).collect();
                let rows = t
                    .rows
                    .iter()
                    .map(|row| indexes.iter().map(|&i| row[i].clone()).collect())
                    .collect();
                rows_then_done(formats, rows)
            }
            Statement::Insert {
                table,
                columns,
                values,
            } => {
                let Some(t) = self.tables.get(&table) else {
                    return not_found(&table);
                };
                let targets: Vec<usize> = match &columns {
                    None => (0..t.columns.len())
                        .filter(|&i| !t.columns[i].identity)
                        .collect(),
                    Some(names) => {
                        let mut targets = Vec::with_capacity(names.len());
                        for name in names {
                            match t
                                .columns
                                .iter()
                                .position(|c| c.format.name.eq_ignore_ascii_case(name))
                            {
                                Some(i) => targets.push(i),
                                None => return fail(207, 16, format!("Invalid column name '{name}'.")),
                            }
                        }
                        targets
                    }
                };
                if targets.len() != values.len() {
                    return fail(
                        213,
                        16,
                        "Insert error: column name or number of supplied values does not match table definition.",
                    );
                }

                let mut row: Vec<Cell> = vec![None; t.columns.len()];
                let mut identity = None;
                for (i, column) in t.columns.iter().enumerate() {
                    if column.identity {
                        let id = t.next_identity + 1;
                        match types::encode(&Value::BigInt(id), &column.format) {
                            Ok(bytes) => row[i] = Some(bytes),
                            Err(e) => return fail(247, 16, e.to_string()),
                        }
                        identity = Some(id);
                    }
                }
                for (&target, item) in targets.iter().zip(&values) {
                    let column = &t.columns[target];
                    let Some(value) = resolve(item) else {
                        return fail(102, 15, "Incorrect syntax near '?'.");
                    };
                    if value.is_null() {
                        if !column.format.is_nullable() {
                            return fail(
                                233,
                                16,
                                format!(
                                    "The column {} in table {table} does not allow null values.",
                                    column.format.name
                                ),
                            );
                        }
                        continue;
                    }
                    match types::encode(&value, &column.format) {
                        Ok(bytes) => row[target] = Some(bytes),
                        Err(e) => {
                            return fail(
                                247,
                                16,
                                format!(
                                    "Arithmetic overflow during implicit conversion to a {} field: {e}",
                                    column.format.datatype.sql_name()
                                ),
                            );
                        }
                    }
                }

                if let Some(t) = self.tables.get_mut(&table) {
                    t.rows.push(row);
                    if let Some(id) = identity {
                        t.next_identity = id;
                        self.identity = id;
                    }
                }
                VecDeque::from([Event::Done(Some(1))])
            }
            Statement::Delete(table) => {
                let Some(t) = self.tables.get_mut(&table) else {
                    return not_found(&table);
                };
                let count = i32::try_from(t.rows.len()).unwrap_or(i32::MAX);
                t.rows.clear();
                VecDeque::from([Event::Done(Some(count))])
            }
            Statement::Create { table, columns } => {
                if self.tables.contains_key(&table) {
                    return fail(
                        2714,
                        16,
                        format!("There is already an object named '{table}' in the database."),
                    );
                }
                let mut defs = Vec::with_capacity(columns.len());
                for column in columns {
                    let Some(format) = column_format(&column.type_name, &column.args) else {
                        return fail(2715, 16, format!("Can't find type '{}'.", column.type_name));
                    };
                    defs.push(TableColumn {
                        format: format.named(column.name).nullable(column.nullable),
                        identity: column.identity,
                    });
                }
                self.tables.insert(
                    table,
                    Table {
                        columns: defs,
                        ..Table::default()
                    },
                );
                succeeded()
            }
            Statement::Drop(table) => {
                if self.tables.remove(&table).is_none() {
                    return fail(
                        3701,
                        11,
                        format!(
                            "Cannot drop the table '{table}', because it doesn't exist in the system catalogs."
                        ),
                    );
                }
                succeeded()
            }
            Statement::WaitFor(seconds) => {
                let timeout = self.sessions.get(&con).and_then(|s| s.timeout);
                match timeout {
                    Some(limit) if u64::try_from(limit).is_ok_and(|l| l < seconds) => {
                        VecDeque::from([Event::TimedOut])
                    }
                    _ => succeeded(),
                }
            }
            Statement::Begin => {
                let tables = self.tables.clone();
                if let Some(session) = self.sessions.get_mut(&con) {
                    if session.tran_count == 0 {
                        session.snapshot = Some(tables);
                    }
                    session.tran_count += 1;
                }
                succeeded()
            }
            Statement::Commit => {
                let Some(session) = self.sessions.get_mut(&con) else {
                    return VecDeque::new();
                };
                if session.tran_count == 0 {
                    return fail(
                        3902,
                        16,
                        "The COMMIT TRANSACTION request has no corresponding BEGIN TRANSACTION.",
                    );
                }
                session.tran_count -= 1;
                if session.tran_count == 0 {
                    session.snapshot = None;
                    session.savepoints.clear();
                }
                succeeded()
            }
            Statement::Rollback(None) => {
                if self.sessions.get(&con).is_none_or(|s| s.tran_count == 0) {
                    return fail(
                        3903,
                        16,
                        "The ROLLBACK TRANSACTION request has no corresponding BEGIN TRANSACTION.",
                    );
                }
                self.rollback_session(con);
                succeeded()
            }
            Statement::Rollback(Some(name)) => {
                let Some(session) = self.sessions.get_mut(&con) else {
                    return VecDeque::new();
                };
                let found = session
                    .savepoints
                    .iter()
                    .rposition(|(n, _)| n.eq_ignore_ascii_case(&name));
                let Some(index) = found.filter(|_| session.tran_count > 0) else {
                    return fail(
                        6401,
                        16,
                        format!("Cannot rollback {name} - no transaction or savepoint of that name found."),
                    );
                };
                session.savepoints.truncate(index + 1);
                self.tables = session.savepoints[index].1.clone();
                succeeded()
            }
            Statement::Save(name) => {
                let tables = self.tables.clone();
                let Some(session) = self.sessions.get_mut(&con) else {
                    return VecDeque::new();
                };
                if session.tran_count == 0 {
                    return fail(
                        628,
                        16,
                        "SAVE TRANSACTION cannot be used outside a transaction.",
                    );
                }
                session.savepoints.push((name, tables));
                succeeded()
            }
            Statement::SetIsolation(level) => {
                if level > 3 {
                    return fail(102, 15, format!("Incorrect syntax near '{level}'."));
                }
                if let Some(session) = self.sessions.get_mut(&con) {
                    session.isolation = Some(level);
                }
                succeeded()
            }
            Statement::Use(database) => {
                if self
                    .databases
                    .as_ref()
                    .is_some_and(|known| !known.contains(&database))
                {
                    return fail(
                        911,
                        11,
                        format!(
                            "Attempt to locate entry in sysdatabases for database '{database}' by name failed - no entry found under that name."
                        ),
                    );
                }
                if let Some(session) = self.sessions.get_mut(&con) {
                    session.database = Some(database);
                }
                succeeded()
            }
        }
    }
}

fn rows_then_done(formats: Vec<DataFormat>, rows: Vec<Vec<Cell>>) -> Events {
    let count = i32::try_from(rows.len()).unwrap_or(i32::MAX);
    VecDeque::from([
        Event::Rows(ResultSet {
            formats,
            rows: rows.into(),
            timeout_after: None,
        }),
        Event::Done(Some(count)),
    ])
}

fn not_found(table: &str) -> Events {
    fail(
        208,
        16,
        format!("{table} not found. Specify owner.objectname or use sp_help to check whether the object exists."),
    )
}

fn scripted(responses: &[MockResponse]) -> Events {
    let mut events = VecDeque::with_capacity(responses.len());
    for response in responses {
        match response {
            MockResponse::Rows(rows) => {
                let mut encoded = VecDeque::with_capacity(rows.rows.len());
                for values in &rows.rows {
                    let mut row = Vec::with_capacity(values.len());
                    for (value, format) in values.iter().zip(&rows.columns) {
                        if value.is_null() {
                            row.push(None);
                            continue;
                        }
                        match types::encode(value, format) {
                            Ok(bytes) => row.push(Some(bytes)),
                            Err(e) => return fail(257, 16, e.to_string()),
                        }
                    }
                    encoded.push_back(row);
                }
                events.push_back(Event::Rows(ResultSet {
                    formats: rows.columns.clone(),
                    rows: encoded,
                    timeout_after: rows.timeout_after,
                }));
            }
            MockResponse::Done(count) => events.push_back(Event::Done(*count)),
            MockResponse::Error {
                number,
                severity,
                message,
            } => events.push_back(Event::Fail(Diagnostic::server(
                *number,
                *severity,
                message.clone(),
            ))),
            MockResponse::TimedOut => events.push_back(Event::TimedOut),
        }
    }
    events
}

fn normalize(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

fn placeholder_count(sql: &str) -> usize {
    let mut quoted = None;
    let mut count = 0;
    for c in sql.chars() {
        match (quoted, c) {
            (None, '\'' | '"') => quoted = Some(c),
            (Some(q), c) if c == q => quoted = None,
            (None, '?') => count += 1,
            _ => {}
        }
    }
    count
}

fn column_format(type_name: &str, args: &[u32]) -> Option<DataFormat> {
    let arg = |i: usize, default: u32| args.get(i).copied().unwrap_or(default);
    let len = |n: u32| i32::try_from(n).ok();
    let fixed = |ty: DbType| Some(default_format(ty));
    match type_name {
        "int" | "integer" => fixed(DbType::Int),
        "smallint" => fixed(DbType::SmallInt),
        "tinyint" => fixed(DbType::TinyInt),
        "bigint" => fixed(DbType::BigInt),
        "unsigned int" | "unsigned integer" => fixed(DbType::UInt),
        "unsigned smallint" => fixed(DbType::USmallInt),
        "unsigned bigint" => fixed(DbType::UBigInt),
        "bit" => fixed(DbType::Bit),
        "real" => fixed(DbType::Real),
        "float" | "double precision" => fixed(DbType::Float),
        "money" => fixed(DbType::Money),
        "smallmoney" => fixed(DbType::Money4),
        "numeric" | "decimal" => {
            let ty = if type_name == "numeric" {
                DbType::Numeric
            } else {
                DbType::Decimal
            };
            Some(DataFormat::new(ty, 35).with_precision(len(arg(0, 18))?, len(arg(1, 0))?))
        }
        "char" => Some(DataFormat::new(DbType::Char, len(arg(0, 1))?)),
        "varchar" => Some(DataFormat::new(DbType::VarChar, len(arg(0, 1))?)),
        "unichar" | "univarchar" => Some(DataFormat::new(DbType::UniChar, len(arg(0, 1) * 2)?)),
        "text" => Some(DataFormat::new(DbType::Text, i32::MAX)),
        "unitext" => Some(DataFormat::new(DbType::UniText, i32::MAX)),
        "binary" => Some(DataFormat::new(DbType::Binary, len(arg(0, 1))?)),
        "varbinary" => Some(DataFormat::new(DbType::VarBinary, len(arg(0, 1))?)),
        "image" => Some(DataFormat::new(DbType::Image, i32::MAX)),
        "datetime" => fixed(DbType::DateTime),
        "smalldatetime" => fixed(DbType::DateTime4),
        "date" => fixed(DbType::Date),
        "time" => fixed(DbType::Time),
        "bigdatetime" => fixed(DbType::BigDateTime),
        "bigtime" => fixed(DbType::BigTime),
        _ => None,
    }
}

// ==================== SQL subset ====================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Sym(char),
}

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Param,
    Int(i64),
    Str(String),
    Null,
    Ident(String),
}

#[derive(Debug)]
struct ColumnDef {
    name: String,
    type_name: String,
    args: Vec<u32>,
    identity: bool,
    nullable: bool,
}

#[derive(Debug)]
enum Statement {
    Select(Vec<Item>),
    Identity,
    SelectFrom {
        table: String,
        columns: Option<Vec<String>>,
    },
    Insert {
        table: String,
        columns: Option<Vec<String>>,
        values: Vec<Item>,
    },
    Delete(String),
    Create {
        table: String,
        columns: Vec<ColumnDef>,
    },
    Drop(String),
    WaitFor(u64),
    Begin,
    Commit,
    Rollback(Option<String>),
    Save(String),
    SetIsolation(u8),
    Use(String),
}

fn syntax_error(near: &str) -> Diagnostic {
    Diagnostic::server(102, 15, format!("Incorrect syntax near '{near}'."))
}

fn lex(sql: &str) -> Result<Vec<Token>, Diagnostic> {
    let mut tokens = Vec::new();
    let mut chars = sql.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                        text.push('\'');
                    }
                    Some('\'') => break,
                    Some(c) => text.push(c),
                    None => {
                        return Err(Diagnostic::server(
                            105,
                            15,
                            format!("Unclosed quote before the character string '{text}'."),
                        ));
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c.is_alphanumeric() || c == '_' || c == '@' || c == '#' {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' || c == '@' || c == '#' || c == '.' {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Word(word));
        } else if ";".contains(c) {
            chars.next();
        } else {
            chars.next();
            tokens.push(Token::Sym(c));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn near(&self) -> Diagnostic {
        match self.peek() {
            Some(Token::Word(w)) => syntax_error(w),
            Some(Token::Str(s)) => syntax_error(s),
            Some(Token::Sym(c)) => syntax_error(&c.to_string()),
            None => syntax_error(self.tokens.last().map_or("", |t| match t {
                Token::Word(w) | Token::Str(w) => w.as_str(),
                Token::Sym(_) => ")",
            })),
        }
    }

    fn keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), Diagnostic> {
        if self.keyword(keyword) {
            Ok(())
        } else {
            Err(self.near())
        }
    }

    fn sym(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_sym(&mut self, sym: char) -> Result<(), Diagnostic> {
        if self.sym(sym) { Ok(()) } else { Err(self.near()) }
    }

    fn ident(&mut self) -> Result<String, Diagnostic> {
        match self.peek() {
            Some(Token::Word(w)) if !w.starts_with(|c: char| c.is_ascii_digit()) => {
                let w = w.clone();
                self.pos += 1;
                Ok(w)
            }
            _ => Err(self.near()),
        }
    }

    fn table(&mut self) -> Result<String, Diagnostic> {
        self.ident().map(|t| t.to_ascii_lowercase())
    }

    fn number(&mut self) -> Result<u32, Diagnostic> {
        match self.peek() {
            Some(Token::Word(w)) => {
                let n = w.parse().map_err(|_| self.near())?;
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.near()),
        }
    }

    fn finish(&self) -> Result<(), Diagnostic> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(self.near())
        }
    }

    fn item(&mut self) -> Result<Item, Diagnostic> {
        let negative = self.sym('-');
        let item = match self.peek().cloned() {
            Some(Token::Sym('?')) if !negative => Item::Param,
            Some(Token::Str(s)) if !negative => Item::Str(s),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("null") && !negative => Item::Null,
            Some(Token::Word(w)) if w.starts_with(|c: char| c.is_ascii_digit()) => {
                let v: i64 = w.parse().map_err(|_| syntax_error(&w))?;
                Item::Int(if negative { -v } else { v })
            }
            Some(Token::Word(w)) if !negative => Item::Ident(w),
            _ => return Err(self.near()),
        };
        self.pos += 1;
        Ok(item)
    }

    fn items(&mut self) -> Result<Vec<Item>, Diagnostic> {
        let mut items = vec![self.item()?];
        while self.sym(',') {
            items.push(self.item()?);
        }
        Ok(items)
    }

    fn ident_list(&mut self) -> Result<Vec<String>, Diagnostic> {
        let mut names = vec![self.ident()?];
        while self.sym(',') {
            names.push(self.ident()?);
        }
        Ok(names)
    }

    fn transaction_word(&mut self) -> bool {
        self.keyword("tran") || self.keyword("transaction") || self.keyword("work")
    }

    fn column_def(&mut self) -> Result<ColumnDef, Diagnostic> {
        let name = self.ident()?;
        let mut type_name = self.ident()?.to_ascii_lowercase();
        if type_name == "unsigned" || type_name == "double" {
            let second = self.ident()?.to_ascii_lowercase();
            type_name = format!("{type_name} {second}");
        }
        let mut args = Vec::new();
        if self.sym('(') {
            args.push(self.number()?);
            while self.sym(',') {
                args.push(self.number()?);
            }
            self.expect_sym(')')?;
        }
        let identity = self.keyword("identity");
        let nullable = if self.keyword("not") {
            self.expect_keyword("null")?;
            false
        } else {
            self.keyword("null")
        };
        Ok(ColumnDef {
            name,
            type_name,
            args,
            identity,
            nullable,
        })
    }
}

fn parse(sql: &str) -> Result<Statement, Diagnostic> {
    let mut p = Parser {
        tokens: lex(sql)?,
        pos: 0,
    };
    let statement = if p.keyword("select") {
        if p.keyword("@@identity") {
            Statement::Identity
        } else if p.sym('*') {
            p.expect_keyword("from")?;
            Statement::SelectFrom {
                table: p.table()?,
                columns: None,
            }
        } else {
            let items = p.items()?;
            if p.keyword("from") {
                let mut columns = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Item::Ident(name) => columns.push(name),
                        _ => return Err(syntax_error("from")),
                    }
                }
                Statement::SelectFrom {
                    table: p.table()?,
                    columns: Some(columns),
                }
            } else {
                if let Some(Item::Ident(name)) = items.iter().find(|i| matches!(i, Item::Ident(_))) {
                    return Err(Diagnostic::server(207, 16, format!("Invalid column name '{name}'.")));
                }
                Statement::Select(items)
            }
        }
    } else if p.keyword("insert") {
        p.keyword("into");
        let table = p.table()?;
        let columns = if p.sym('(') {
            let names = p.ident_list()?;
            p.expect_sym(')')?;
            Some(names)
        } else {
            None
        };
        p.expect_keyword("values")?;
        p.expect_sym('(')?;
        let values = p.items()?;
        p.expect_sym(')')?;
        Statement::Insert {
            table,
            columns,
            values,
        }
    } else if p.keyword("delete") {
        p.keyword("from");
        Statement::Delete(p.table()?)
    } else if p.keyword("create") {
        p.expect_keyword("table")?;
        let table = p.table()?;
        p.expect_sym('(')?;
        let mut columns = vec![p.column_def()?];
        while p.sym(',') {
            columns.push(p.column_def()?);
        }
        p.expect_sym(')')?;
        Statement::Create { table, columns }
    } else if p.keyword("drop") {
        p.expect_keyword("table")?;
        Statement::Drop(p.table()?)
    } else if p.keyword("waitfor") {
        p.expect_keyword("delay")?;
        let Some(Token::Str(delay)) = p.peek().cloned() else {
            return Err(p.near());
        };
        p.pos += 1;
        Statement::WaitFor(parse_delay(&delay).ok_or_else(|| syntax_error(&delay))?)
    } else if p.keyword("begin") {
        if !p.transaction_word() {
            return Err(p.near());
        }
        Statement::Begin
    } else if p.keyword("commit") {
        p.transaction_word();
        Statement::Commit
    } else if p.keyword("rollback") {
        p.transaction_word();
        if p.pos < p.tokens.len() {
            Statement::Rollback(Some(p.ident()?))
        } else {
            Statement::Rollback(None)
        }
    } else if p.keyword("save") {
        if !p.transaction_word() {
            return Err(p.near());
        }
        Statement::Save(p.ident()?)
    } else if p.keyword("set") {
        p.expect_keyword("transaction")?;
        p.expect_keyword("isolation")?;
        p.expect_keyword("level")?;
        let level = p.number()?;
        Statement::SetIsolation(u8::try_from(level).map_err(|_| syntax_error(&level.to_string()))?)
    } else if p.keyword("use") {
        Statement::Use(p.ident()?)
    } else {
        return Err(p.near());
    };
    p.finish()?;
    Ok(statement)
}

/// `hh:mm:ss` to seconds.
fn parse_delay(delay: &str) -> Option<u64> {
    let mut parts = delay.split(':').map(|p| p.trim().parse::<u64>());
    let (h, m, s) = (parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?);
    if parts.next().is_some() || m > 59 || s > 59 {
        return None;
    }
    Some(h * 3600 + m * 60 + s)
}

// ==================== ClientLibrary ====================

fn text(value: &CStr) -> String {
    value.to_string_lossy().into_owned()
}

impl ClientLibrary for MockLibrary {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn cs_ctx_alloc(&self, version: i32) -> Result<RawContext, RetCode> {
        let mut state = self.state();
        if let Some(rc) = state.enter(Verb::CtxAlloc) {
            return Err(rc);
        }
        if version < ffi::CS_VERSION_125 {
            return Err(RetCode::FAIL);
        }
        let handle = state.allocate();
        state.contexts.insert(handle, false);
        Ok(RawContext::from_raw(handle))
    }

    fn ct_init(&self, ctx: RawContext, _version: i32) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.enter(Verb::Init) {
            return rc;
        }
        match state.contexts.get_mut(&ctx.as_raw()) {
            Some(initialized) => {
                *initialized = true;
                RetCode::SUCCEED
            }
            None => RetCode::FAIL,
        }
    }

    fn ct_exit(&self, ctx: RawContext, force: bool) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.enter(Verb::Exit) {
            return rc;
        }
        let ctx = ctx.as_raw();
        if !state.contexts.contains_key(&ctx) {
            return RetCode::FAIL;
        }
        let open: Vec<usize> = state
            .sessions
            .iter()
            .filter(|(_, s)| s.ctx == ctx)
            .map(|(&h, _)| h)
            .collect();
        if !open.is_empty() {
            if !force {
                return RetCode::FAIL;
            }
            for con in open {
                state.sessions.remove(&con);
                state.commands.retain(|_, c| c.con != con);
            }
        }
        state.contexts.insert(ctx, false);
        RetCode::SUCCEED
    }

    fn cs_ctx_drop(&self, ctx: RawContext) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.enter(Verb::CtxDrop) {
            return rc;
        }
        match state.contexts.get(&ctx.as_raw()) {
            Some(false) => {
                state.contexts.remove(&ctx.as_raw());
                RetCode::SUCCEED
            }
            _ => RetCode::FAIL,
        }
    }

    fn ct_con_alloc(&self, ctx: RawContext) -> Result<RawConnection, RetCode> {
        let mut state = self.state();
        if let Some(rc) = state.enter(Verb::ConAlloc) {
            return Err(rc);
        }
        if state.contexts.get(&ctx.as_raw()) != Some(&true) {
            return Err(RetCode::FAIL);
        }
        let handle = state.allocate();
        state.sessions.insert(
            handle,
            MockSession {
                ctx: ctx.as_raw(),
                ..MockSession::default()
            },
        );
        Ok(RawConnection::from_raw(handle))
    }

    fn ct_con_props(&self, con: RawConnection, property: ConProperty, value: &CStr) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_con(Verb::ConProps, con.as_raw()) {
            return rc;
        }
        match state.sessions.get_mut(&con.as_raw()) {
            Some(session) if !session.connected => {
                session.props.insert(property, text(value));
                RetCode::SUCCEED
            }
            _ => RetCode::FAIL,
        }
    }

    fn ct_connect(&self, con: RawConnection, server: Option<&CStr>) -> RetCode {
        let mut state = self.state();
        let con = con.as_raw();
        if let Some(rc) = state.injected_on_con(Verb::Connect, con) {
            return rc;
        }
        let credentials = state.credentials.clone();
        let Some(session) = state.sessions.get_mut(&con) else {
            return RetCode::FAIL;
        };
        if session.connected {
            return RetCode::FAIL;
        }
        let Some(username) = session.props.get(&ConProperty::Username).cloned() else {
            session.messages.push(Diagnostic::client(
                0,
                1,
                "ct_connect(): user api layer: external error: A username is required.",
            ));
            return RetCode::FAIL;
        };
        let password = session
            .props
            .get(&ConProperty::Password)
            .cloned()
            .unwrap_or_default();
        if let Some((user, pass)) = credentials {
            if user != username || pass != password {
                session
                    .messages
                    .push(Diagnostic::server(4002, 14, "Login failed."));
                return RetCode::FAIL;
            }
        }
        session.connected = true;
        state.connect_targets.push(server.map(text));
        RetCode::SUCCEED
    }

    fn ct_close(&self, con: RawConnection, option: CloseOption) -> RetCode {
        let mut state = self.state();
        let con = con.as_raw();
        if let Some(rc) = state.injected_on_con(Verb::Close, con) {
            return rc;
        }
        let Some(session) = state.sessions.get_mut(&con) else {
            return RetCode::FAIL;
        };
        if option == CloseOption::Unused && (!session.connected || session.busy.is_some()) {
            session.messages.push(Diagnostic::client(
                0,
                1,
                "ct_close(): user api layer: external error: This routine cannot be called while results are pending.",
            ));
            return RetCode::FAIL;
        }
        session.connected = false;
        session.busy = None;
        session.dynamic.clear();
        let commands: Vec<usize> = state
            .commands
            .iter()
            .filter(|(_, c)| c.con == con)
            .map(|(&h, _)| h)
            .collect();
        for cmd in commands {
            state.clear_command(cmd);
        }
        state.rollback_session(con);
        RetCode::SUCCEED
    }

    fn ct_con_drop(&self, con: RawConnection) -> RetCode {
        let mut state = self.state();
        let con = con.as_raw();
        if let Some(rc) = state.injected_on_con(Verb::ConDrop, con) {
            return rc;
        }
        let has_commands = state.commands.values().any(|c| c.con == con);
        match state.sessions.get(&con) {
            Some(session) if !session.connected && !has_commands => {
                state.sessions.remove(&con);
                RetCode::SUCCEED
            }
            _ => RetCode::FAIL,
        }
    }

    fn ct_timeout(&self, con: RawConnection, seconds: Option<i32>) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_con(Verb::Timeout, con.as_raw()) {
            return rc;
        }
        match state.sessions.get_mut(&con.as_raw()) {
            Some(session) => {
                session.timeout = seconds;
                state.timeouts.push(seconds);
                RetCode::SUCCEED
            }
            None => RetCode::FAIL,
        }
    }

    fn ct_text_limit(&self, con: RawConnection, bytes: i32) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_con(Verb::TextLimit, con.as_raw()) {
            return rc;
        }
        match state.sessions.get_mut(&con.as_raw()) {
            Some(session) => {
                session.text_limit = Some(bytes);
                RetCode::SUCCEED
            }
            None => RetCode::FAIL,
        }
    }

    fn ct_cmd_alloc(&self, con: RawConnection) -> Result<RawCommand, RetCode> {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_con(Verb::CmdAlloc, con.as_raw()) {
            return Err(rc);
        }
        if !state.sessions.get(&con.as_raw()).is_some_and(|s| s.connected) {
            return Err(RetCode::FAIL);
        }
        let handle = state.allocate();
        state.commands.insert(
            handle,
            MockCommand {
                con: con.as_raw(),
                ..MockCommand::default()
            },
        );
        Ok(RawCommand::from_raw(handle))
    }

    fn ct_cmd_drop(&self, cmd: RawCommand) -> RetCode {
        let mut state = self.state();
        let cmd = cmd.as_raw();
        if let Some(rc) = state.injected_on_cmd(Verb::CmdDrop, cmd) {
            return rc;
        }
        let Some(con) = state.commands.get(&cmd).map(|c| c.con) else {
            return RetCode::FAIL;
        };
        if state.sessions.get(&con).is_some_and(|s| s.busy == Some(cmd)) {
            state.client_message(
                con,
                "ct_cmd_drop(): user api layer: external error: This routine cannot be called while the command has pending results.".to_string(),
            );
            return RetCode::FAIL;
        }
        state.commands.remove(&cmd);
        RetCode::SUCCEED
    }

    fn ct_command(&self, cmd: RawCommand, text_value: &CStr) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_cmd(Verb::Command, cmd.as_raw()) {
            return rc;
        }
        match state.commands.get_mut(&cmd.as_raw()) {
            Some(command) if command.initiated.is_none() => {
                command.initiated = Some(Initiated::Language(text(text_value)));
                command.params.clear();
                RetCode::SUCCEED
            }
            _ => RetCode::FAIL,
        }
    }

    fn ct_dynamic(
        &self,
        cmd: RawCommand,
        op: DynamicOp,
        name: &CStr,
        text_value: Option<&CStr>,
    ) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_cmd(Verb::Dynamic, cmd.as_raw()) {
            return rc;
        }
        if op == DynamicOp::Prepare && text_value.is_none() {
            return RetCode::FAIL;
        }
        match state.commands.get_mut(&cmd.as_raw()) {
            Some(command) if command.initiated.is_none() => {
                command.initiated = Some(Initiated::Dynamic {
                    op,
                    name: text(name),
                    text: text_value.map(text),
                });
                command.params.clear();
                RetCode::SUCCEED
            }
            _ => RetCode::FAIL,
        }
    }

    fn ct_param(&self, cmd: RawCommand, format: &DataFormat, data: Option<&[u8]>) -> RetCode {
        let mut state = self.state();
        let cmd = cmd.as_raw();
        if let Some(rc) = state.injected_on_cmd(Verb::Param, cmd) {
            return rc;
        }
        let value = match data {
            None => Ok(Value::Null),
            Some(bytes) => types::decode(format, bytes),
        };
        let con = match state.commands.get_mut(&cmd) {
            Some(command)
                if matches!(
                    command.initiated,
                    Some(Initiated::Dynamic {
                        op: DynamicOp::Execute,
                        ..
                    })
                ) =>
            {
                match value {
                    Ok(value) => {
                        command.params.push(value);
                        return RetCode::SUCCEED;
                    }
                    Err(_) => command.con,
                }
            }
            _ => return RetCode::FAIL,
        };
        state.client_message(
            con,
            "ct_param(): user api layer: external error: The parameter value could not be converted.".to_string(),
        );
        RetCode::FAIL
    }

    fn ct_send(&self, cmd: RawCommand) -> RetCode {
        let mut state = self.state();
        let cmd = cmd.as_raw();
        if let Some(rc) = state.injected_on_cmd(Verb::Send, cmd) {
            if let Some(command) = state.commands.get_mut(&cmd) {
                command.initiated = None;
                command.params.clear();
            }
            return rc;
        }
        let Some(command) = state.commands.get(&cmd) else {
            return RetCode::FAIL;
        };
        let con = command.con;
        if command.initiated.is_none() {
            return RetCode::FAIL;
        }
        if state.sessions.get(&con).is_some_and(|s| s.busy.is_some()) {
            state.client_message(
                con,
                "ct_send(): user api layer: external error: This routine cannot be called while results are pending for a command that has been sent to the server.".to_string(),
            );
            return RetCode::FAIL;
        }
        let events = state.run(cmd);
        if let Some(command) = state.commands.get_mut(&cmd) {
            command.events = events;
            command.current = None;
            command.row_count = None;
        }
        if let Some(session) = state.sessions.get_mut(&con) {
            session.busy = Some(cmd);
        }
        RetCode::SUCCEED
    }

    fn ct_results(&self, cmd: RawCommand) -> Result<ResultType, RetCode> {
        let mut state = self.state();
        let cmd = cmd.as_raw();
        if let Some(rc) = state.injected_on_cmd(Verb::Results, cmd) {
            return Err(rc);
        }
        let Some(command) = state.commands.get_mut(&cmd) else {
            return Err(RetCode::FAIL);
        };
        let con = command.con;
        if !state.sessions.get(&con).is_some_and(|s| s.busy == Some(cmd)) {
            return Err(RetCode::FAIL);
        }
        let Some(command) = state.commands.get_mut(&cmd) else {
            return Err(RetCode::FAIL);
        };
        command.current = None;
        match command.events.pop_front() {
            None => {
                if let Some(session) = state.sessions.get_mut(&con) {
                    session.busy = None;
                }
                Err(RetCode::END_RESULTS)
            }
            Some(Event::Rows(set)) => {
                command.current = Some(set);
                Ok(ResultType::Row)
            }
            Some(Event::Succeed) => Ok(ResultType::CmdSucceed),
            Some(Event::Done(count)) => {
                command.row_count = count;
                Ok(ResultType::CmdDone)
            }
            Some(Event::Fail(diag)) => {
                if let Some(session) = state.sessions.get_mut(&con) {
                    session.messages.push(diag);
                }
                Ok(ResultType::CmdFail)
            }
            Some(Event::TimedOut) => {
                command.events.push_front(Event::TimedOut);
                state.client_message(
                    con,
                    "ct_results(): network packet layer: internal net library error: Net-Library operation timed out".to_string(),
                );
                Err(RetCode::TIMED_OUT)
            }
        }
    }

    fn ct_res_info(&self, cmd: RawCommand, info: ResInfo) -> Result<i32, RetCode> {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_cmd(Verb::ResInfo, cmd.as_raw()) {
            return Err(rc);
        }
        let command = state.commands.get(&cmd.as_raw()).ok_or(RetCode::FAIL)?;
        match info {
            ResInfo::NumData => command
                .current
                .as_ref()
                .and_then(|set| i32::try_from(set.formats.len()).ok())
                .ok_or(RetCode::FAIL),
            ResInfo::RowCount => Ok(command.row_count.unwrap_or(ffi::CS_NO_COUNT)),
        }
    }

    fn ct_describe(&self, cmd: RawCommand, item: i32) -> Result<DataFormat, RetCode> {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_cmd(Verb::Describe, cmd.as_raw()) {
            return Err(rc);
        }
        let index = usize::try_from(item - 1).map_err(|_| RetCode::FAIL)?;
        state
            .commands
            .get(&cmd.as_raw())
            .and_then(|c| c.current.as_ref())
            .and_then(|set| set.formats.get(index).cloned())
            .ok_or(RetCode::FAIL)
    }

    fn ct_fetch(&self, cmd: RawCommand, buffers: &mut [ColumnBuffer]) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.injected_on_cmd(Verb::Fetch, cmd.as_raw()) {
            return rc;
        }
        let Some(set) = state
            .commands
            .get_mut(&cmd.as_raw())
            .and_then(|c| c.current.as_mut())
        else {
            return RetCode::FAIL;
        };
        if buffers.len() != set.formats.len() {
            return RetCode::FAIL;
        }
        match &mut set.timeout_after {
            Some(0) => return RetCode::TIMED_OUT,
            Some(left) => *left -= 1,
            None => {}
        }
        let Some(row) = set.rows.pop_front() else {
            return RetCode::END_DATA;
        };
        let mut truncated = false;
        for (buffer, cell) in buffers.iter_mut().zip(row) {
            match cell {
                None => {
                    buffer.indicator = -1;
                    buffer.len = 0;
                }
                Some(bytes) => {
                    let n = bytes.len().min(buffer.data.len());
                    buffer.data[..n].copy_from_slice(&bytes[..n]);
                    buffer.len = i32::try_from(n).unwrap_or(i32::MAX);
                    if n < bytes.len() {
                        truncated = true;
                        buffer.indicator = i16::try_from(bytes.len()).unwrap_or(i16::MAX);
                    } else {
                        buffer.indicator = 0;
                    }
                }
            }
        }
        if truncated {
            RetCode::ROW_FAIL
        } else {
            RetCode::SUCCEED
        }
    }

    fn ct_cancel(&self, target: CancelTarget, kind: CancelKind) -> RetCode {
        let mut state = self.state();
        if let Some(rc) = state.enter(Verb::Cancel) {
            return rc;
        }
        let commands: Vec<usize> = match target {
            CancelTarget::Command(cmd) => {
                if !state.commands.contains_key(&cmd.as_raw()) {
                    return RetCode::FAIL;
                }
                vec![cmd.as_raw()]
            }
            CancelTarget::Connection(con) => state
                .commands
                .iter()
                .filter(|(_, c)| c.con == con.as_raw())
                .map(|(&h, _)| h)
                .collect(),
        };
        for cmd in commands {
            match kind {
                CancelKind::Current => {
                    if let Some(command) = state.commands.get_mut(&cmd) {
                        command.current = None;
                    }
                }
                CancelKind::All | CancelKind::Attention => state.clear_command(cmd),
            }
        }
        RetCode::SUCCEED
    }

    fn take_messages(&self, con: RawConnection) -> Vec<Diagnostic> {
        self.state()
            .sessions
            .get_mut(&con.as_raw())
            .map(|s| std::mem::take(&mut s.messages))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(s: &str) -> std::ffi::CString {
        std::ffi::CString::new(s).unwrap()
    }

    fn connected(lib: &MockLibrary) -> (RawContext, RawConnection) {
        let ctx = lib.cs_ctx_alloc(ffi::CS_VERSION_150).unwrap();
        assert!(lib.ct_init(ctx, ffi::CS_VERSION_150).is_succeed());
        let con = lib.ct_con_alloc(ctx).unwrap();
        assert!(lib.ct_con_props(con, ConProperty::Username, &c("sa")).is_succeed());
        assert!(lib.ct_connect(con, None).is_succeed());
        (ctx, con)
    }

    fn language(lib: &MockLibrary, con: RawConnection, sql: &str) -> Vec<ResultType> {
        let cmd = lib.ct_cmd_alloc(con).unwrap();
        assert!(lib.ct_command(cmd, &c(sql)).is_succeed());
        assert!(lib.ct_send(cmd).is_succeed());
        let mut seen = Vec::new();
        while let Ok(rt) = lib.ct_results(cmd) {
            if rt == ResultType::Row {
                lib.ct_cancel(CancelTarget::Command(cmd), CancelKind::Current);
            }
            seen.push(rt);
        }
        assert!(lib.ct_cmd_drop(cmd).is_succeed());
        seen
    }

    #[test]
    fn parses_the_supported_subset() {
        assert!(matches!(parse("SELECT ?").unwrap(), Statement::Select(_)));
        assert!(matches!(parse("select @@identity").unwrap(), Statement::Identity));
        assert!(matches!(
            parse("CREATE TABLE t (a numeric(10, 2) NULL, b int identity)").unwrap(),
            Statement::Create { .. }
        ));
        assert!(matches!(
            parse("insert into t (a) values (?)").unwrap(),
            Statement::Insert { .. }
        ));
        assert!(matches!(
            parse("WAITFOR DELAY '00:00:05'").unwrap(),
            Statement::WaitFor(5)
        ));
        assert!(matches!(
            parse("ROLLBACK TRANSACTION sp1").unwrap(),
            Statement::Rollback(Some(_))
        ));
        let err = parse("SELEC 1").unwrap_err();
        assert_eq!(err.number, 102);
        assert!(err.text.contains("SELEC"));
    }

    #[test]
    fn placeholders_outside_quotes() {
        assert_eq!(placeholder_count("SELECT ?, '?', ?"), 2);
    }

    #[test]
    fn handles_are_counted() {
        let lib = MockLibrary::new();
        let (ctx, con) = connected(&lib);
        assert_eq!(lib.live_contexts(), 1);
        assert_eq!(lib.live_connections(), 1);
        assert_eq!(lib.ct_exit(ctx, false), RetCode::FAIL);
        assert!(lib.ct_close(con, CloseOption::Unused).is_succeed());
        assert!(lib.ct_con_drop(con).is_succeed());
        assert!(lib.ct_exit(ctx, false).is_succeed());
        assert!(lib.cs_ctx_drop(ctx).is_succeed());
        assert_eq!(lib.live_contexts(), 0);
        assert_eq!(lib.live_connections(), 0);
    }

    #[test]
    fn one_busy_command_per_connection() {
        let lib = MockLibrary::new();
        let (_, con) = connected(&lib);
        let first = lib.ct_cmd_alloc(con).unwrap();
        let second = lib.ct_cmd_alloc(con).unwrap();
        assert!(lib.ct_command(first, &c("SELECT 1")).is_succeed());
        assert!(lib.ct_send(first).is_succeed());
        assert!(lib.ct_command(second, &c("SELECT 2")).is_succeed());
        assert_eq!(lib.ct_send(second), RetCode::FAIL);
        assert!(!lib.take_messages(con).is_empty());
        assert_eq!(lib.ct_cmd_drop(first), RetCode::FAIL);
        assert!(lib
            .ct_cancel(CancelTarget::Command(first), CancelKind::All)
            .is_succeed());
        assert!(lib.ct_cmd_drop(first).is_succeed());
    }

    #[test]
    fn rollback_restores_tables() {
        let lib = MockLibrary::new();
        let (_, con) = connected(&lib);
        language(&lib, con, "CREATE TABLE t (a int)");
        language(&lib, con, "BEGIN TRANSACTION");
        language(&lib, con, "INSERT INTO t VALUES (1)");
        assert_eq!(lib.row_count("t"), Some(1));
        language(&lib, con, "ROLLBACK TRANSACTION");
        assert_eq!(lib.row_count("t"), Some(0));
    }

    #[test]
    fn login_is_checked() {
        let lib = MockLibrary::new();
        lib.set_credentials("sa", "secret");
        let ctx = lib.cs_ctx_alloc(ffi::CS_VERSION_150).unwrap();
        lib.ct_init(ctx, ffi::CS_VERSION_150);
        let con = lib.ct_con_alloc(ctx).unwrap();
        lib.ct_con_props(con, ConProperty::Username, &c("sa"));
        lib.ct_con_props(con, ConProperty::Password, &c("wrong"));
        assert_eq!(lib.ct_connect(con, None), RetCode::FAIL);
        let messages = lib.take_messages(con);
        assert_eq!(messages[0].number, 4002);
    }

    #[test]
    fn injected_failures_fire_once() {
        let lib = MockLibrary::new();
        lib.fail_next(Verb::CtxAlloc);
        assert_eq!(lib.cs_ctx_alloc(ffi::CS_VERSION_150), Err(RetCode::FAIL));
        assert!(lib.cs_ctx_alloc(ffi::CS_VERSION_150).is_ok());
        assert_eq!(lib.call_count(Verb::CtxAlloc), 2);
    }

    #[test]
    fn waitfor_times_out_under_a_shorter_timeout() {
        let lib = MockLibrary::new();
        let (_, con) = connected(&lib);
        lib.ct_timeout(con, Some(1));
        let cmd = lib.ct_cmd_alloc(con).unwrap();
        lib.ct_command(cmd, &c("WAITFOR DELAY '00:00:05'"));
        assert!(lib.ct_send(cmd).is_succeed());
        assert_eq!(lib.ct_results(cmd), Err(RetCode::TIMED_OUT));
        lib.ct_cancel(CancelTarget::Command(cmd), CancelKind::Attention);
        assert!(lib.ct_cmd_drop(cmd).is_succeed());
        assert_eq!(lib.timeouts(), vec![Some(1)]);
    }
}
