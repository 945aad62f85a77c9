//! Test Utilities Crate
//!
//! Shared test infrastructure for the haulage billing test suite.
//!
//! # Modules
//!
//! - `fixtures`: The in-memory harness and canned jobs from `domain_invoicing`
//! - `builders`: Builders for jobs, assignments and companies
//! - `database`: PostgreSQL container management for store tests
//! - `assertions`: Assertions over money and invoice trees
//! - `generators`: Property-based generators for jobs

pub mod fixtures;
pub mod builders;
pub mod database;
pub mod assertions;
pub mod generators;

pub use fixtures::*;
pub use builders::*;
pub use database::*;
pub use assertions::*;
pub use generators::*;
