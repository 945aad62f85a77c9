//! Notification fan-out planning
//!
//! Services never send inline. They build a `Vec<Notification>` (one entry
//! per recipient and channel) with the planners below and hand it to the
//! [`NotificationDispatcher`], which delivers best-effort and logs failures.
//! Message wording is left to the delivery side; a notification only carries
//! a topic and structured data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use core_kernel::{BusinessHours, UserId};

use crate::party::{Admin, Company};
use crate::ports::NotificationGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Push,
    Sms,
    Email,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    InvoiceGenerated,
    DisputeOpened,
    DisputeResolved,
    LateFeeCharged,
    DueReminder,
    CashAdvanceRequested,
    CashAdvanceReviewed,
}

/// Where a notification goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: UserId,
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Recipient {
    /// Recipients without an address for a channel are skipped for it
    fn reachable_by(&self, channel: Channel) -> bool {
        match channel {
            Channel::Sms => self.phone.is_some(),
            Channel::Email => self.email.is_some(),
            Channel::Push | Channel::Socket => true,
        }
    }
}

impl From<&Company> for Recipient {
    fn from(company: &Company) -> Self {
        Self {
            user_id: company.user_id,
            phone: company.contact.phone.clone(),
            email: company.contact.email.clone(),
        }
    }
}

impl From<&Admin> for Recipient {
    fn from(admin: &Admin) -> Self {
        Self {
            user_id: admin.user_id,
            phone: admin.phone.clone(),
            email: admin.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub recipient: Recipient,
    pub channel: Channel,
    pub topic: Topic,
    pub data: serde_json::Value,
}

/// One notification per recipient and reachable channel
pub fn fan_out(
    recipients: &[Recipient],
    channels: &[Channel],
    topic: Topic,
    data: &serde_json::Value,
) -> Vec<Notification> {
    recipients
        .iter()
        .flat_map(|recipient| {
            channels
                .iter()
                .filter(move |channel| recipient.reachable_by(**channel))
                .map(move |channel| Notification {
                    recipient: recipient.clone(),
                    channel: *channel,
                    topic,
                    data: data.clone(),
                })
        })
        .collect()
}

/// Admin broadcast over socket and email
pub fn plan_admin_broadcast(admins: &[Admin], topic: Topic, data: serde_json::Value) -> Vec<Notification> {
    let recipients: Vec<Recipient> = admins.iter().map(Recipient::from).collect();
    fan_out(&recipients, &[Channel::Socket, Channel::Email], topic, &data)
}

/// Notifies a company on the given channels
pub fn plan_company(
    company: &Company,
    channels: &[Channel],
    topic: Topic,
    data: serde_json::Value,
) -> Vec<Notification> {
    fan_out(&[Recipient::from(company)], channels, topic, &data)
}

/// Email always, SMS only inside the company's local business hours
pub fn plan_business_hours_alert(
    company: &Company,
    hours: &BusinessHours,
    now: DateTime<Utc>,
    topic: Topic,
    data: serde_json::Value,
) -> Vec<Notification> {
    let mut channels = vec![Channel::Email];
    if hours.contains(now, &company.contact.timezone) {
        channels.push(Channel::Sms);
    }
    plan_company(company, &channels, topic, data)
}

/// Outcome of a dispatch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Executes planned notifications best-effort
#[derive(Clone)]
pub struct NotificationDispatcher {
    gateway: Arc<dyn NotificationGateway>,
}

impl NotificationDispatcher {
    pub fn new(gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { gateway }
    }

    /// Delivers every notification; a failed delivery never stops the rest
    pub async fn dispatch(&self, notifications: Vec<Notification>) -> DispatchReport {
        let mut report = DispatchReport::default();
        for notification in &notifications {
            match self.gateway.deliver(notification).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        user_id = %notification.recipient.user_id,
                        channel = ?notification.channel,
                        topic = ?notification.topic,
                        error = %e,
                        "Notification delivery failed"
                    );
                }
            }
        }
        debug!(delivered = report.delivered, failed = report.failed, "Notifications dispatched");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party::Contact;
    use crate::ports::mock::RecordingNotificationGateway;
    use chrono::TimeZone;
    use core_kernel::{CompanyId, Timezone};
    use std::str::FromStr;

    fn contractor(phone: Option<&str>) -> Company {
        Company {
            id: CompanyId::new_v7(),
            name: "Ridge Paving".to_string(),
            short_id: None,
            user_id: UserId::new_v7(),
            associated_user_id: None,
            payout_account: None,
            contact: Contact {
                phone: phone.map(str::to_string),
                email: Some("ap@ridgepaving.test".to_string()),
                timezone: Timezone::from_str("America/Chicago").unwrap(),
            },
        }
    }

    fn admin() -> Admin {
        Admin {
            user_id: UserId::new_v7(),
            email: Some("ops@haulage.test".to_string()),
            phone: None,
        }
    }

    #[test]
    fn test_admin_broadcast_is_one_entry_per_admin_and_channel() {
        let admins = vec![admin(), admin(), admin()];
        let plan = plan_admin_broadcast(&admins, Topic::DisputeOpened, serde_json::json!({}));
        assert_eq!(plan.len(), 6);
        assert_eq!(plan.iter().filter(|n| n.channel == Channel::Socket).count(), 3);
    }

    #[test]
    fn test_sms_only_inside_business_hours() {
        let company = contractor(Some("+15550100"));
        let hours = BusinessHours::default();

        // 15:00 UTC in January is 09:00 in Chicago
        let open = Utc.with_ymd_and_hms(2024, 1, 15, 15, 0, 0).unwrap();
        let plan = plan_business_hours_alert(&company, &hours, open, Topic::LateFeeCharged, serde_json::json!({}));
        assert!(plan.iter().any(|n| n.channel == Channel::Sms));
        assert!(plan.iter().any(|n| n.channel == Channel::Email));

        // 03:00 UTC is 21:00 the previous evening in Chicago
        let closed = Utc.with_ymd_and_hms(2024, 1, 15, 3, 0, 0).unwrap();
        let plan = plan_business_hours_alert(&company, &hours, closed, Topic::LateFeeCharged, serde_json::json!({}));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].channel, Channel::Email);
    }

    #[test]
    fn test_channels_without_address_are_skipped() {
        let company = contractor(None);
        let plan = plan_company(&company, &[Channel::Sms, Channel::Push, Channel::Email], Topic::CashAdvanceReviewed, serde_json::json!({}));
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|n| n.channel != Channel::Sms));
    }

    #[tokio::test]
    async fn test_dispatch_continues_after_failures() {
        let gateway = Arc::new(RecordingNotificationGateway::new());
        gateway.fail_channel(Channel::Email).await;
        let dispatcher = NotificationDispatcher::new(gateway.clone());

        let plan = plan_admin_broadcast(&[admin(), admin()], Topic::InvoiceGenerated, serde_json::json!({}));
        let report = dispatcher.dispatch(plan).await;

        assert_eq!(report, DispatchReport { delivered: 2, failed: 2 });
        assert_eq!(gateway.delivered().await.len(), 2);
    }
}
