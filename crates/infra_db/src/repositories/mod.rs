//! SQL access for invoicing records, companies and administrators
//!
//! Repositories speak in rows and JSON documents and report
//! [`DatabaseError`](crate::DatabaseError); the adapters translate to the
//! domain ports.

pub mod parties;
pub mod records;

pub use parties::{AdminRow, PartyRepository};
pub use records::{RecordRepository, StoredRecord};
