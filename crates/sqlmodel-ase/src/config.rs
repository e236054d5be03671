//! Connection configuration and DSN parsing.
//!
//! A DSN is a whitespace-separated list of `key=value` pairs:
//!
//! ```text
//! user=sa password='s3cr3t pass' host=tcp:db.example:5000 database=pubs2
//! ```
//!
//! Values may be single- or double-quoted; inside quotes a backslash escapes
//! the next character. `username`, `password`, `host` and `database` are
//! recognized, with the aliases `user`, `pass`, `server` and `db`.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlmodel_core::{Error, Result};

/// Default receive-buffer limit for text and image columns (32 KiB).
pub const DEFAULT_TEXT_LIMIT: usize = 32 * 1024;

/// The fields of a parsed DSN.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsnInfo {
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Server name or `tcp:host:port`; `None` uses the directory default.
    pub host: Option<String>,
    /// Applied with `use <database>` after connecting.
    pub database: Option<String>,
}

impl fmt::Debug for DsnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DsnInfo")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("database", &self.database)
            .finish()
    }
}

impl FromStr for DsnInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_dsn(s)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Key {
    Username,
    Password,
    Host,
    Database,
}

impl Key {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "username" | "user" => Key::Username,
            "password" | "pass" => Key::Password,
            "host" | "server" => Key::Host,
            "database" | "db" => Key::Database,
            _ => return None,
        })
    }

    const fn name(self) -> &'static str {
        match self {
            Key::Username => "username",
            Key::Password => "password",
            Key::Host => "host",
            Key::Database => "database",
        }
    }
}

fn pair_regex() -> Result<&'static Regex> {
    static PAIR: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PAIR.get_or_init(|| {
        Regex::new(
            r#"\s*([A-Za-z_][A-Za-z0-9_]*)=('(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"|[^\s'"]*)"#,
        )
    })
    .as_ref()
    .map_err(|e| Error::config(format!("invalid DSN pattern: {e}")))
}

fn unquote(raw: &str) -> String {
    let quoted = raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')));
    if !quoted {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len() - 2);
    let mut chars = raw[1..raw.len() - 1].chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse a DSN string.
///
/// Unknown and repeated keys are rejected, as are DSNs without a username or
/// password. An empty host means the server directory default.
pub fn parse_dsn(dsn: &str) -> Result<DsnInfo> {
    let mut fields: [Option<String>; 4] = Default::default();
    let mut pos = 0;

    for caps in pair_regex()?.captures_iter(dsn) {
        let (Some(whole), Some(name), Some(value)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        if whole.start() != pos {
            break;
        }
        pos = whole.end();

        let key = Key::parse(name.as_str())
            .ok_or_else(|| Error::config(format!("invalid DSN: unknown key '{}'", name.as_str())))?;
        let slot = &mut fields[key as usize];
        if slot.is_some() {
            return Err(Error::config(format!(
                "invalid DSN: duplicate key '{}'",
                key.name()
            )));
        }
        *slot = Some(unquote(value.as_str()));
    }

    let rest = &dsn[pos..];
    if !rest.trim().is_empty() {
        let near: String = rest.trim_start().chars().take(16).collect();
        return Err(Error::config(format!("invalid DSN: unexpected text near '{near}'")));
    }

    let [username, password, host, database] = fields;
    let username = username
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::config("invalid DSN: username is required"))?;
    let password = password.ok_or_else(|| Error::config("invalid DSN: password is required"))?;

    Ok(DsnInfo {
        username,
        password,
        host: host.filter(|h| !h.is_empty()),
        database: database.filter(|d| !d.is_empty()),
    })
}

/// Settings for opening an [`AseConnection`](crate::AseConnection).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AseConfig {
    /// Login name
    pub username: String,
    /// Login password; never serialized
    #[serde(skip_serializing)]
    pub password: String,
    /// Server directory entry or `tcp:host:port`; `None` uses the directory default
    pub host: Option<String>,
    /// Database selected with `use` after login
    pub database: Option<String>,
    /// `CS_APPNAME` reported to the server
    pub app_name: Option<String>,
    /// Timeout applied to statements run without an explicit deadline
    pub query_timeout: Option<Duration>,
    /// Receive-buffer size for text, image and long columns
    pub text_limit: usize,
}

impl Default for AseConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            host: None,
            database: None,
            app_name: None,
            query_timeout: None,
            text_limit: DEFAULT_TEXT_LIMIT,
        }
    }
}

impl fmt::Debug for AseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AseConfig")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("database", &self.database)
            .field("app_name", &self.app_name)
            .field("query_timeout", &self.query_timeout)
            .field("text_limit", &self.text_limit)
            .finish()
    }
}

impl AseConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from a DSN string.
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        parse_dsn(dsn).map(Self::from)
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the server to connect to.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the database selected after login.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Set the timeout for statements run without a deadline.
    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    /// Set the text/image receive-buffer limit.
    pub fn text_limit(mut self, limit: usize) -> Self {
        self.text_limit = limit;
        self
    }
}

impl From<DsnInfo> for AseConfig {
    fn from(dsn: DsnInfo) -> Self {
        Self {
            username: dsn.username,
            password: dsn.password,
            host: dsn.host,
            database: dsn.database,
            ..Self::default()
        }
    }
}

impl FromStr for AseConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_dsn(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_message(err: &Error) -> &str {
        match err {
            Error::Config(c) => &c.message,
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn parses_basic_dsn() {
        let dsn = parse_dsn("user=sa password=secret host=tcp:db.example:5000").unwrap();
        assert_eq!(dsn.username, "sa");
        assert_eq!(dsn.password, "secret");
        assert_eq!(dsn.host.as_deref(), Some("tcp:db.example:5000"));
        assert_eq!(dsn.database, None);
    }

    #[test]
    fn quoted_values_and_escapes() {
        let dsn: DsnInfo = r#"  username='o\'brien' password="a b\"c" database=pubs2  "#
            .parse()
            .unwrap();
        assert_eq!(dsn.username, "o'brien");
        assert_eq!(dsn.password, "a b\"c");
        assert_eq!(dsn.database.as_deref(), Some("pubs2"));
        assert_eq!(dsn.host, None);
    }

    #[test]
    fn empty_host_uses_directory() {
        let dsn = parse_dsn("user=sa password= host=''").unwrap();
        assert_eq!(dsn.password, "");
        assert_eq!(dsn.host, None);
    }

    #[test]
    fn rejects_unknown_and_duplicate_keys() {
        let err = parse_dsn("user=sa password=x port=5000").unwrap_err();
        assert!(config_message(&err).contains("unknown key 'port'"));
        let err = parse_dsn("user=sa pass=x password=y").unwrap_err();
        assert!(config_message(&err).contains("duplicate key 'password'"));
    }

    #[test]
    fn requires_credentials() {
        let err = parse_dsn("password=x").unwrap_err();
        assert!(config_message(&err).contains("username is required"));
        let err = parse_dsn("user=sa").unwrap_err();
        assert!(config_message(&err).contains("password is required"));
        assert!(parse_dsn("user= password=x").is_err());
    }

    #[test]
    fn rejects_garbage() {
        let err = parse_dsn("user=sa password=x and more").unwrap_err();
        assert!(config_message(&err).contains("unexpected text near 'and more'"));
        assert!(parse_dsn("user='unterminated password=x").is_err());
    }

    #[test]
    fn debug_redacts_password() {
        let config = AseConfig::from_dsn("user=sa password=hunter2").unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
        let printed = format!("{:?}", parse_dsn("user=sa password=hunter2").unwrap());
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn builder_and_serde() {
        let config = AseConfig::new()
            .username("sa")
            .password("secret")
            .host("SYBASE")
            .app_name("billing")
            .query_timeout(Duration::from_secs(30));
        assert_eq!(config.text_limit, DEFAULT_TEXT_LIMIT);

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"), "{json}");
        assert!(!json.contains("password"), "{json}");
        let back: AseConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.username, "sa");
        assert_eq!(back.password, "");
        assert_eq!(back.host.as_deref(), Some("SYBASE"));
        assert_eq!(back.query_timeout, Some(Duration::from_secs(30)));

        let partial: AseConfig =
            serde_json::from_str(r#"{"username":"sa","password":"x"}"#).unwrap();
        assert_eq!(partial.text_limit, DEFAULT_TEXT_LIMIT);
        assert_eq!(partial.database, None);
        assert_eq!(partial.password, "x");

        let info = parse_dsn("user=sa password=hunter2 host=SYBASE").unwrap();
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("hunter2"), "{json}");
        let back: DsnInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.password, "");
        assert_eq!(back.host.as_deref(), Some("SYBASE"));
    }
}
