//! Invoicing domain errors

use thiserror::Error;

use core_kernel::{
    DisputeId, DriverInvoiceId, JobId, ManualPaymentId, MoneyError, OwnerInvoiceId, PortError,
};

use crate::ports::GatewayError;

/// Errors that can occur in the invoicing domain
#[derive(Debug, Error)]
pub enum InvoicingError {
    /// The owner already has a pending or approved cash advance on this invoice
    #[error("Cash advance already requested for owner invoice {0}")]
    AlreadyAppliedForCashAdvance(OwnerInvoiceId),

    /// A previous cash advance request was rejected; requests are one-shot
    #[error("Cash advance was already rejected for owner invoice {0}")]
    CashAdvanceAlreadyRejected(OwnerInvoiceId),

    /// Review attempted without a prior request
    #[error("No cash advance requested for owner invoice {0}")]
    NoCashAdvanceRequested(OwnerInvoiceId),

    /// The payment gateway refused the operation for lack of platform balance
    #[error("Payment gateway balance insufficient: {0}")]
    StripeBalanceInsufficient(String),

    /// The payer or payee bank account is not verified
    #[error("Bank account not verified: {0}")]
    UnverifiedBankAccount(String),

    /// Any other payment gateway failure
    #[error("Payment gateway error: {0}")]
    StripeGatewayError(String),

    #[error("Dispute not found: {0}")]
    DisputeNotFound(String),

    #[error("{kind} not found: {id}")]
    InvoiceNotFound {
        kind: String,
        id: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A payment-rail event referenced an id no invoice carries
    #[error("No {kind} correlated with {id}")]
    CorrelationNotFound {
        kind: &'static str,
        id: String,
    },

    #[error("Driver invoice {0} is under an open dispute")]
    TicketUnderDispute(DriverInvoiceId),

    #[error("Driver invoice {0} already has an open dispute")]
    DisputeAlreadyOpen(DriverInvoiceId),

    #[error("Dispute {0} is already resolved")]
    DisputeAlreadyResolved(DisputeId),

    #[error("Job {0} has already been invoiced")]
    JobAlreadyInvoiced(JobId),

    #[error("Job {0} has no billable assignments")]
    NothingToInvoice(JobId),

    #[error("Invoice {0} is already paid")]
    InvoiceAlreadyPaid(String),

    #[error("A manual payment is already awaiting review for {0}")]
    ManualPaymentAlreadySubmitted(String),

    #[error("Manual payment {0} has already been reviewed")]
    ManualPaymentAlreadyReviewed(ManualPaymentId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown commodity kind: {0}")]
    UnknownCommodityKind(String),

    /// A concurrent writer changed one of the records first
    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Store error: {0}")]
    Store(PortError),
}

impl InvoicingError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        InvoicingError::InvalidState(message.into())
    }

    /// Returns true if repeating the operation later may succeed
    ///
    /// Lost optimistic-concurrency races, generic gateway failures and
    /// transient store failures are retryable. Domain rule violations and
    /// correlation misses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvoicingError::Conflict(_) | InvoicingError::StripeGatewayError(_) => true,
            InvoicingError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<PortError> for InvoicingError {
    fn from(error: PortError) -> Self {
        match error {
            PortError::NotFound { entity_type, id } => match entity_type.as_str() {
                "DisputeInvoice" => InvoicingError::DisputeNotFound(id),
                "JobInvoice" | "OwnerJobInvoice" | "DriverJobInvoice" | "LateFeeInvoice" => {
                    InvoicingError::InvoiceNotFound { kind: entity_type, id }
                }
                _ => InvoicingError::NotFound { entity: entity_type, id },
            },
            PortError::Conflict { message } => InvoicingError::Conflict(message),
            other => InvoicingError::Store(other),
        }
    }
}

impl From<GatewayError> for InvoicingError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::BalanceInsufficient(message) => {
                InvoicingError::StripeBalanceInsufficient(message)
            }
            GatewayError::UnverifiedBankAccount(message) => {
                InvoicingError::UnverifiedBankAccount(message)
            }
            GatewayError::Declined(message) | GatewayError::Unavailable(message) => {
                InvoicingError::StripeGatewayError(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_not_found_maps_by_entity() {
        let dispute: InvoicingError = PortError::not_found("DisputeInvoice", "d-1").into();
        assert!(matches!(dispute, InvoicingError::DisputeNotFound(id) if id == "d-1"));

        let ticket: InvoicingError = PortError::not_found("DriverJobInvoice", "t-1").into();
        assert!(matches!(ticket, InvoicingError::InvoiceNotFound { .. }));

        let company: InvoicingError = PortError::not_found("Company", "c-1").into();
        assert!(matches!(company, InvoicingError::NotFound { .. }));
    }

    #[test]
    fn test_conflicts_are_retryable() {
        let error: InvoicingError = PortError::conflict("stale version").into();
        assert!(error.is_retryable());
        assert!(!InvoicingError::DisputeNotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_gateway_errors_are_classified() {
        let balance: InvoicingError = GatewayError::BalanceInsufficient("low".into()).into();
        assert!(matches!(balance, InvoicingError::StripeBalanceInsufficient(_)));
        assert!(!balance.is_retryable());

        let declined: InvoicingError = GatewayError::Declined("card".into()).into();
        assert!(matches!(declined, InvoicingError::StripeGatewayError(_)));
        assert!(declined.is_retryable());
    }
}
