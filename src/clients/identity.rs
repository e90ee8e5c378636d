use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::models::principal::{Principal, Role};

/// Resolves authenticated subjects to principals.
///
/// `Ok(None)` means the subject is unknown; `Err` means the store could not
/// answer and the request must not proceed.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_principal(&self, subject: &str) -> Result<Option<Principal>, Error>;

    /// Lookup by normalized (lowercase) email, used by passcode sign-in.
    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}

pub struct PostgresIdentityStore {
    client: Client,
}

impl PostgresIdentityStore {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection closed with error");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    async fn query_principal(
        &self,
        filter: &'static str,
        value: &str,
    ) -> Result<Option<Principal>, Error> {
        let statement = format!(
            "SELECT id::text AS id, roles, premium, premium_expires_at FROM users WHERE {} = $1",
            filter
        );

        let row = self
            .client
            .query_opt(statement.as_str(), &[&value])
            .await
            .map_err(|e| anyhow!("Identity lookup failed: {}", e))?;

        let Some(row) = row else {
            debug!(filter, "No matching principal in identity store");
            return Ok(None);
        };

        let id: String = row.try_get("id")?;
        let roles = row
            .try_get::<_, Vec<String>>("roles")?
            .iter()
            .filter_map(|role| {
                let parsed = Role::from_string(role);
                if parsed.is_none() {
                    warn!(principal_id = %id, role = %role, "Ignoring unknown role");
                }
                parsed
            })
            .collect();

        Ok(Some(Principal {
            id,
            roles,
            premium: row.try_get("premium")?,
            premium_expires_at: row.try_get::<_, Option<DateTime<Utc>>>("premium_expires_at")?,
        }))
    }
}

#[async_trait]
impl IdentityStore for PostgresIdentityStore {
    async fn find_principal(&self, subject: &str) -> Result<Option<Principal>, Error> {
        self.query_principal("id::text", subject).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, Error> {
        self.query_principal("lower(email)", email).await
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

/// Process-local store for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryIdentityStore {
    principals: Arc<DashMap<String, Principal>>,
    emails: Arc<DashMap<String, String>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, principal: Principal) {
        self.principals.insert(principal.id.clone(), principal);
    }

    pub fn insert_with_email(&self, principal: Principal, email: &str) {
        self.emails
            .insert(email.to_ascii_lowercase(), principal.id.clone());
        self.insert(principal);
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_principal(&self, subject: &str) -> Result<Option<Principal>, Error> {
        Ok(self.principals.get(subject).map(|entry| entry.value().clone()))
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Principal>, Error> {
        let Some(id) = self.emails.get(email).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };

        self.find_principal(&id).await
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}
