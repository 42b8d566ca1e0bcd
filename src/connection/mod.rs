//! Reaching the database
//!
//! - [`resolve`] turns settings and secrets into a primary target and an
//!   optional direct fallback
//! - [`Establisher`] connects with bounded retry, waiting on pool health first
//! - [`postgres`] holds the `may_postgres` session used in production

pub mod establish;
pub mod pool_health;
pub mod postgres;
pub mod resolver;

pub use establish::{Connector, Establisher, PoolHealthPolicy, RetryPolicy};
pub use pool_health::{HttpPoolHealthProbe, PoolHealthProbe, ProbeError};
pub use postgres::{PgConnector, PgSession};
pub use resolver::{requires_tls, resolve, ConnectionTarget, ResolvedConnection};
