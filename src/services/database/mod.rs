mod driver;
mod manager;
mod query;
mod types;

pub use driver::{DatabaseDriver, PgCredentials, SqlxDriver};
pub use manager::{ConnectionPool, SLOW_QUERY_TARGET};
pub use types::{PoolConfig, QueryOutcome, ResultCell, ResultRow};
