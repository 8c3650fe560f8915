use std::time::Duration;

/// Bounds and observability settings for a `ConnectionPool`.
///
/// The connection target is not part of the config. It is the tunnel's
/// local endpoint, known only once the tunnel is open, and is passed to
/// `ConnectionPool::open` separately.
///
/// `max_idle <= max_open` is expected but not enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections kept warm once opened
    pub max_idle: u32,
    /// Upper bound on concurrently open connections
    pub max_open: u32,
    /// Statements slower than this emit a slow-query record
    pub slow_query_threshold: Duration,
    /// Idle connections above `max_idle` are closed after this long
    pub idle_timeout: Duration,
    /// Bound on waiting for a free connection; `None` keeps the driver default
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 1,
            max_open: 2,
            slow_query_threshold: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: None,
        }
    }
}

/// A cell value with its column metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultCell {
    pub column: String,
    pub type_name: String,
    /// String representation of the value
    pub value: String,
    pub is_null: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRow {
    pub cells: Vec<ResultCell>,
}

impl ResultRow {
    /// First column of the row, for scalar statements.
    pub fn scalar(&self) -> Option<&ResultCell> {
        self.cells.first()
    }
}

/// Result of a single-row statement. "No rows" is a valid outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Row { row: ResultRow, elapsed: Duration },
    NoRows { elapsed: Duration },
}

impl QueryOutcome {
    pub fn row(&self) -> Option<&ResultRow> {
        match self {
            QueryOutcome::Row { row, .. } => Some(row),
            QueryOutcome::NoRows { .. } => None,
        }
    }

    pub fn is_no_rows(&self) -> bool {
        matches!(self, QueryOutcome::NoRows { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            QueryOutcome::Row { elapsed, .. } | QueryOutcome::NoRows { elapsed } => *elapsed,
        }
    }

    /// Text of the first cell, `None` for no rows or SQL NULL.
    pub fn into_scalar(self) -> Option<String> {
        match self {
            QueryOutcome::Row { row, .. } => row
                .scalar()
                .filter(|cell| !cell.is_null)
                .map(|cell| cell.value.clone()),
            QueryOutcome::NoRows { .. } => None,
        }
    }
}
