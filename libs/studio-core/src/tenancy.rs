//! Tenant routing.
//!
//! Every admin owns one logical database. Regular users operate inside the
//! database of the admin they selected, or inside `main` when they have none.
//! `main` also holds the global user directory.
//!
//! The [`ConnectionRegistry`] caches one connection per tenant for the lifetime
//! of the process. First access for a tenant goes through a per-tenant
//! `OnceCell`, so concurrent requests for a previously unseen tenant open
//! exactly one connection.

use crate::domain::user::{Role, User, UserFilter};
use crate::{CoreError, DatabaseConnector, TenantDatabase};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub const MAIN_TENANT: &str = "main";

// Postgres truncates identifiers at 63 bytes.
const MAX_DATABASE_NAME_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn main() -> Self {
        TenantId(MAIN_TENANT.to_string())
    }

    /// Tenant owned by the admin with the given id.
    pub fn for_admin(admin_id: &str) -> Result<Self, CoreError> {
        validate_segment(admin_id)?;
        Ok(TenantId(admin_id.to_string()))
    }

    /// Admins are sovereign over their own tenant; users follow their admin.
    pub fn for_principal(user: &User) -> Result<Self, CoreError> {
        match (user.role, user.admin_id.as_deref()) {
            (Role::Admin, _) => Self::for_admin(&user.id),
            (Role::User, Some(admin_id)) => Self::for_admin(admin_id),
            (Role::User, None) => Ok(Self::main()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_main(&self) -> bool {
        self.0 == MAIN_TENANT
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Database name for a tenant: `<prefix>-<tenant>`.
pub fn database_name(prefix: &str, tenant: &TenantId) -> Result<String, CoreError> {
    validate_segment(prefix)?;
    validate_segment(tenant.as_str())?;
    let name = format!("{prefix}-{}", tenant.as_str());
    if name.len() > MAX_DATABASE_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "database name '{name}' exceeds {MAX_DATABASE_NAME_LEN} characters"
        )));
    }
    Ok(name)
}

// Only characters that survive a connection URI and a quoted SQL identifier.
fn validate_segment(segment: &str) -> Result<(), CoreError> {
    if segment.is_empty() {
        return Err(CoreError::Validation("tenant identifier cannot be empty".into()));
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "unsafe tenant identifier '{segment}'"
        )));
    }
    Ok(())
}

/// The resolved tenant for one request: its database plus the global directory.
#[derive(Clone)]
pub struct TenantScope {
    pub tenant: TenantId,
    pub db: Arc<dyn TenantDatabase>,
    pub directory: Arc<dyn TenantDatabase>,
}

impl fmt::Debug for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantScope")
            .field("tenant", &self.tenant)
            .field("db", &self.db.name())
            .finish()
    }
}

type ConnectionCell = Arc<OnceCell<Arc<dyn TenantDatabase>>>;

/// Process-wide cache of tenant connections.
pub struct ConnectionRegistry {
    prefix: String,
    connector: Arc<dyn DatabaseConnector>,
    connections: DashMap<TenantId, ConnectionCell>,
}

impl ConnectionRegistry {
    pub fn new(prefix: &str, connector: Arc<dyn DatabaseConnector>) -> Result<Self, CoreError> {
        validate_segment(prefix)
            .map_err(|e| CoreError::Configuration(format!("invalid database prefix: {e}")))?;
        Ok(Self {
            prefix: prefix.to_string(),
            connector,
            connections: DashMap::new(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the cached connection for `tenant`, opening it on first use.
    pub async fn connection(&self, tenant: &TenantId) -> Result<Arc<dyn TenantDatabase>, CoreError> {
        // Clone the cell out so no map guard is held across the await below.
        let cell = self
            .connections
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        let db = cell
            .get_or_try_init(|| async {
                let name = database_name(&self.prefix, tenant)?;
                info!(tenant = %tenant, database = %name, "Opening tenant database");
                self.connector.connect(&name).await
            })
            .await?;
        Ok(db.clone())
    }

    /// The main database holding the user directory.
    pub async fn main(&self) -> Result<Arc<dyn TenantDatabase>, CoreError> {
        self.connection(&TenantId::main()).await
    }

    pub async fn scope(&self, tenant: TenantId) -> Result<TenantScope, CoreError> {
        let directory = self.main().await?;
        let db = if tenant.is_main() {
            directory.clone()
        } else {
            self.connection(&tenant).await?
        };
        Ok(TenantScope {
            tenant,
            db,
            directory,
        })
    }

    /// `main` plus the tenant of every registered admin. Admins whose id cannot
    /// name a database are logged and left out.
    pub async fn known_tenants(&self) -> Result<Vec<TenantId>, CoreError> {
        let admins = self
            .main()
            .await?
            .list_users(&UserFilter {
                role: Some(Role::Admin),
                admin_id: None,
            })
            .await?;

        let mut tenants = vec![TenantId::main()];
        for admin in &admins {
            match TenantId::for_admin(&admin.id) {
                Ok(tenant) => tenants.push(tenant),
                Err(e) => warn!(admin_id = %admin.id, "Skipping admin with unusable id: {}", e),
            }
        }
        Ok(tenants)
    }

    /// Tenants with an open connection.
    pub fn open_tenants(&self) -> Vec<TenantId> {
        self.connections
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Closes every cached connection. Called once at shutdown.
    pub async fn close_all(&self) {
        let cells: Vec<(TenantId, ConnectionCell)> = self
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        self.connections.clear();

        for (tenant, cell) in cells {
            match cell.get() {
                Some(db) => {
                    info!(tenant = %tenant, database = %db.name(), "Closing tenant database");
                    db.close().await;
                }
                None => warn!(tenant = %tenant, "Tenant connection was never initialized"),
            }
        }
    }
}
