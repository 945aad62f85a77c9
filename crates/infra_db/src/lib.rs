//! Infrastructure Database Layer
//!
//! PostgreSQL persistence for the invoicing domain using SQLx.
//!
//! # Storage model
//!
//! Every invoicing record (jobs, the three invoice tiers, disputes, late fees
//! and manual payments) is one JSONB document in `invoicing_records`, keyed by
//! kind and id and guarded by a `version` column. A domain change set is
//! written in a single transaction: inserts must be new, updates must carry
//! the stored version, and any miss rolls the whole set back.
//!
//! # Example
//!
//! ```rust,ignore
//! use infra_db::{create_pool, run_migrations, DatabaseConfig, PgInvoiceStore};
//!
//! let pool = create_pool(DatabaseConfig::new("postgres://localhost/haulage_billing")).await?;
//! run_migrations(&pool).await?;
//! let store = PgInvoiceStore::new(pool);
//! ```

pub mod adapters;
pub mod error;
pub mod pool;
pub mod repositories;

pub use adapters::{PgInvoiceStore, PgPartyDirectory};
pub use error::DatabaseError;
pub use pool::{create_pool, run_migrations, DatabaseConfig, DatabasePool};
