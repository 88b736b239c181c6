/// PostgreSQL persistence for the job store.
///
/// This module provides `PostgresJobStore`, a PostgreSQL-backed
/// implementation of [`crate::queue::JobStore`] and
/// [`crate::queue::StuckJobScanner`].
pub mod postgres;

pub use postgres::PostgresJobStore;
