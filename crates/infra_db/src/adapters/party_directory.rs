//! PostgreSQL Party Directory Adapter

use async_trait::async_trait;
use sqlx::PgPool;

use core_kernel::{CompanyId, DomainPort, PortError};
use domain_invoicing::{Admin, Company, PartyDirectory};

use crate::repositories::PartyRepository;

/// PostgreSQL-backed implementation of [`PartyDirectory`]
#[derive(Debug, Clone)]
pub struct PgPartyDirectory {
    repository: PartyRepository,
}

impl PgPartyDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            repository: PartyRepository::new(pool),
        }
    }

    /// Returns the underlying repository, used to seed companies and admins
    pub fn repository(&self) -> &PartyRepository {
        &self.repository
    }
}

impl DomainPort for PgPartyDirectory {}

#[async_trait]
impl PartyDirectory for PgPartyDirectory {
    async fn company(&self, id: CompanyId) -> Result<Company, PortError> {
        Ok(self.repository.get_company(*id.as_uuid()).await?)
    }

    async fn admins(&self) -> Result<Vec<Admin>, PortError> {
        let rows = self.repository.active_admins().await?;
        Ok(rows.into_iter().map(Admin::from).collect())
    }
}
