//! Optional PostgreSQL-backed persistence for the scheduler's
//! `ProcessedSet`. A scheduler can run entirely without this crate; it
//! exists for operators who want ticket-resolution state to survive a
//! restart without relying solely on the tracker's own labels.

pub mod config;
pub mod pool;
pub mod store;

pub use config::DbConfig;
pub use store::PgProcessedStore;
