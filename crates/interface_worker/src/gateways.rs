//! Outbound gateways used when no payment rail or messaging provider is wired
//!
//! The worker still runs every sweep against them: payment calls fail as
//! retryable `Unavailable` errors and notifications are written to the log.

use async_trait::async_trait;
use tracing::{info, warn};

use core_kernel::{DomainPort, Money, PortError};
use domain_invoicing::ports::{GatewayError, Payer, PaymentChannel, PaymentIntent};
use domain_invoicing::{JobInvoice, Notification, NotificationGateway, PaymentGateway};

/// Payment gateway that refuses every call
#[derive(Debug, Clone, Default)]
pub struct DisabledPaymentGateway;

impl DisabledPaymentGateway {
    fn refuse(operation: &str) -> GatewayError {
        warn!(operation, "Payment gateway is not configured");
        GatewayError::Unavailable(format!("{operation}: payment gateway not configured"))
    }
}

impl DomainPort for DisabledPaymentGateway {}

#[async_trait]
impl PaymentGateway for DisabledPaymentGateway {
    async fn create_payment_intent(
        &self,
        _amount: Money,
        _reference: &str,
        _payer: &Payer,
        _channel: PaymentChannel,
    ) -> Result<PaymentIntent, GatewayError> {
        Err(Self::refuse("create_payment_intent"))
    }

    async fn create_charge(
        &self,
        _amount: Money,
        _reference: &str,
        _payer: &Payer,
        _channel: PaymentChannel,
    ) -> Result<String, GatewayError> {
        Err(Self::refuse("create_charge"))
    }

    async fn create_transfer(
        &self,
        _amount: Money,
        _destination: &str,
        _idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        Err(Self::refuse("create_transfer"))
    }

    async fn create_invoice(&self, _invoice: &JobInvoice) -> Result<String, GatewayError> {
        Err(Self::refuse("create_invoice"))
    }
}

/// Notification gateway that logs each delivery
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationGateway;

impl DomainPort for LoggingNotificationGateway {}

#[async_trait]
impl NotificationGateway for LoggingNotificationGateway {
    async fn deliver(&self, notification: &Notification) -> Result<(), PortError> {
        info!(
            user_id = %notification.recipient.user_id,
            channel = ?notification.channel,
            topic = ?notification.topic,
            data = %notification.data,
            "Notification"
        );
        Ok(())
    }
}
