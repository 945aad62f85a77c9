//! Companies and administrators as seen by invoicing

use serde::{Deserialize, Serialize};

use core_kernel::{CompanyId, Timezone, UserId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
    pub timezone: Timezone,
}

/// A contractor or owner company
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    /// Persistent short id used in order numbers when present
    pub short_id: Option<String>,
    pub user_id: UserId,
    /// User id of the counterpart this company is associated with
    pub associated_user_id: Option<UserId>,
    /// Destination account for owner payouts
    pub payout_account: Option<String>,
    pub contact: Contact,
}

impl Company {
    /// Two companies are associated only when each references the other
    pub fn is_associated_with(&self, other: &Company) -> bool {
        self.associated_user_id == Some(other.user_id)
            && other.associated_user_id == Some(self.user_id)
    }

    /// `{order}-{short id}` or `{order}-{fallback}`
    pub fn order_number(&self, order: &str, fallback: u32) -> String {
        match &self.short_id {
            Some(short) => format!("{}-{}", order, short),
            None => format!("{}-{}", order, fallback),
        }
    }
}

/// A platform administrator receiving operational notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admin {
    pub user_id: UserId,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(short_id: Option<&str>) -> Company {
        Company {
            id: CompanyId::new_v7(),
            name: "Gravel Co".to_string(),
            short_id: short_id.map(str::to_string),
            user_id: UserId::new_v7(),
            associated_user_id: None,
            payout_account: None,
            contact: Contact::default(),
        }
    }

    #[test]
    fn test_association_must_be_mutual() {
        let mut contractor = company(None);
        let mut owner = company(None);

        contractor.associated_user_id = Some(owner.user_id);
        assert!(!contractor.is_associated_with(&owner));

        owner.associated_user_id = Some(contractor.user_id);
        assert!(contractor.is_associated_with(&owner));
        assert!(owner.is_associated_with(&contractor));
    }

    #[test]
    fn test_order_number_prefers_short_id() {
        assert_eq!(company(Some("GRV")).order_number("J1042", 2), "J1042-GRV");
        assert_eq!(company(None).order_number("J1042", 2), "J1042-2");
    }
}
