//! Domain Adapters
//!
//! Implementations of the invoicing ports backed by PostgreSQL:
//! - [`PgInvoiceStore`] for [`InvoiceStore`](domain_invoicing::InvoiceStore)
//! - [`PgPartyDirectory`] for [`PartyDirectory`](domain_invoicing::PartyDirectory)

pub mod invoice_store;
pub mod party_directory;

pub use invoice_store::PgInvoiceStore;
pub use party_directory::PgPartyDirectory;
