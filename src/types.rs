//! Core types shared by views, the registry and streams.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Description of a query, opaque to the broker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryDef {
    /// Table (or named query) the query reads from.
    pub table: String,

    /// Query arguments, passed through to the sync client.
    #[serde(default)]
    pub args: Value,
}

impl QueryDef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            args: Value::Null,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }
}

/// Address of a shareable query object, used as its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct QueryAddress(usize);

/// Handle to a query.
///
/// Clones of a `Query` share one identity. Two queries built separately from
/// equal definitions are different identities; pass an explicit key to the
/// registry to share them. Ephemeral queries have no identity at all and
/// always get a fresh view unless a key is supplied.
#[derive(Clone)]
pub struct Query {
    def: Arc<QueryDef>,
    shareable: bool,
}

impl Query {
    /// Create a query whose clones share one identity.
    pub fn new(def: QueryDef) -> Self {
        Self {
            def: Arc::new(def),
            shareable: true,
        }
    }

    /// Create a query with no identity.
    pub fn ephemeral(def: QueryDef) -> Self {
        Self {
            def: Arc::new(def),
            shareable: false,
        }
    }

    pub fn def(&self) -> &QueryDef {
        &self.def
    }

    pub fn table(&self) -> &str {
        &self.def.table
    }

    pub fn is_shareable(&self) -> bool {
        self.shareable
    }

    /// True if both handles refer to the same query object.
    pub fn same_identity(&self, other: &Query) -> bool {
        self.shareable && other.shareable && Arc::ptr_eq(&self.def, &other.def)
    }

    pub(crate) fn address(&self) -> Option<QueryAddress> {
        if self.shareable {
            Some(QueryAddress(Arc::as_ptr(&self.def) as usize))
        } else {
            None
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("table", &self.def.table)
            .field("args", &self.def.args)
            .field("shareable", &self.shareable)
            .finish()
    }
}

impl From<QueryDef> for Query {
    fn from(def: QueryDef) -> Self {
        Query::new(def)
    }
}

/// How long a view's data may be retained after its last consumer goes away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Ttl {
    /// Drop immediately (`"none"`).
    Immediate,
    /// Keep for the lifetime of the client (`"forever"`).
    Forever,
    /// Keep for a fixed duration.
    After(Duration),
}

impl Ttl {
    pub fn from_millis(ms: u64) -> Self {
        Ttl::After(Duration::from_millis(ms))
    }

    pub fn from_secs(secs: u64) -> Self {
        Ttl::After(Duration::from_secs(secs))
    }

    /// Duration, if finite.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Ttl::Immediate => Some(Duration::ZERO),
            Ttl::Forever => None,
            Ttl::After(d) => Some(*d),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(d: Duration) -> Self {
        Ttl::After(d)
    }
}

impl From<u64> for Ttl {
    fn from(ms: u64) -> Self {
        Ttl::from_millis(ms)
    }
}

const MS_PER_SECOND: u128 = 1000;
const MS_PER_MINUTE: u128 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u128 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u128 = 24 * MS_PER_HOUR;

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Immediate => write!(f, "none"),
            Ttl::Forever => write!(f, "forever"),
            Ttl::After(d) => {
                let ms = d.as_millis();
                if ms == 0 {
                    write!(f, "0ms")
                } else if ms % MS_PER_DAY == 0 {
                    write!(f, "{}d", ms / MS_PER_DAY)
                } else if ms % MS_PER_HOUR == 0 {
                    write!(f, "{}h", ms / MS_PER_HOUR)
                } else if ms % MS_PER_MINUTE == 0 {
                    write!(f, "{}m", ms / MS_PER_MINUTE)
                } else if ms % MS_PER_SECOND == 0 {
                    write!(f, "{}s", ms / MS_PER_SECOND)
                } else {
                    write!(f, "{}ms", ms)
                }
            }
        }
    }
}

/// Error parsing a TTL string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Invalid TTL: {0:?}")]
pub struct ParseTtlError(pub String);

impl FromStr for Ttl {
    type Err = ParseTtlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "none" => return Ok(Ttl::Immediate),
            "forever" => return Ok(Ttl::Forever),
            _ => {}
        }

        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len());
        let (digits, unit) = trimmed.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| ParseTtlError(s.to_string()))?;

        let per_unit: u64 = match unit {
            "" | "ms" => 1,
            "s" => 1000,
            "m" => 60 * 1000,
            "h" => 60 * 60 * 1000,
            "d" => 24 * 60 * 60 * 1000,
            _ => return Err(ParseTtlError(s.to_string())),
        };

        amount
            .checked_mul(per_unit)
            .map(Ttl::from_millis)
            .ok_or_else(|| ParseTtlError(s.to_string()))
    }
}

impl TryFrom<String> for Ttl {
    type Error = ParseTtlError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ttl> for String {
    fn from(ttl: Ttl) -> Self {
        ttl.to_string()
    }
}

/// Classification of a subscription emission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    /// Partial or optimistic data.
    Unknown,
    /// Fully synced with the server.
    Complete,
    /// The query failed.
    Error,
}

/// Error payload attached to an error emission.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErroredQuery {
    /// Error type reported by the client (e.g. `"app"`, `"http"`).
    pub error_type: Option<String>,
    pub message: Option<String>,
    pub details: Option<Value>,
}

impl ErroredQuery {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One update delivered by a materialized client view.
#[derive(Clone, Debug, PartialEq)]
pub struct Emission {
    pub snapshot: Value,
    pub kind: ResultKind,
    pub error: Option<ErroredQuery>,
}

impl Emission {
    pub fn unknown(snapshot: Value) -> Self {
        Self {
            snapshot,
            kind: ResultKind::Unknown,
            error: None,
        }
    }

    pub fn complete(snapshot: Value) -> Self {
        Self {
            snapshot,
            kind: ResultKind::Complete,
            error: None,
        }
    }

    pub fn error(snapshot: Value, error: ErroredQuery) -> Self {
        Self {
            snapshot,
            kind: ResultKind::Error,
            error: Some(error),
        }
    }
}

/// Connection state reported by the sync client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    NeedsAuth,
    Error,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::NeedsAuth => "needs-auth",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Which result a one-shot run should wait for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// Return whatever is available locally.
    #[default]
    Unknown,
    /// Wait for the server to confirm the result.
    Complete,
}

/// Options for a one-shot query run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub kind: RunKind,
    #[serde(default)]
    pub ttl: Option<Ttl>,
}

impl RunOptions {
    pub fn complete() -> Self {
        Self {
            kind: RunKind::Complete,
            ..Default::default()
        }
    }
}

/// Options for a preload request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PreloadOptions {
    #[serde(default)]
    pub ttl: Option<Ttl>,
}
