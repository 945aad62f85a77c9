//! Off-platform payment claims

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use core_kernel::{JobInvoiceId, LateFeeInvoiceId, ManualPaymentId};

/// The invoice a manual payment claims to settle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum PaymentTarget {
    JobInvoice(JobInvoiceId),
    LateFee(LateFeeInvoiceId),
}

impl std::fmt::Display for PaymentTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentTarget::JobInvoice(id) => write!(f, "{}", id),
            PaymentTarget::LateFee(id) => write!(f, "{}", id),
        }
    }
}

/// A claim that an invoice was paid outside the payment rail
///
/// Rejected claims are kept with `rejected = true` and the reason, so the
/// history of attempts stays visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualPayment {
    pub id: ManualPaymentId,
    pub target: PaymentTarget,
    pub order_number: String,
    pub account_number: String,
    pub attachments: Vec<String>,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected: bool,
    pub rejected_at: Option<DateTime<Utc>>,
    pub reject_reason: Option<String>,
    pub version: u64,
}

impl ManualPayment {
    /// Neither approved nor rejected yet
    pub fn is_awaiting_review(&self) -> bool {
        self.approved_at.is_none() && !self.rejected
    }
}

/// Details supplied with a manual payment claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualPaymentRequest {
    pub target: PaymentTarget,
    pub account_number: String,
    pub attachments: Vec<String>,
}
