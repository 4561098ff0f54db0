// The account store is treated as an external, injectable dependency: the
// dispatcher reads snapshots and requests updates through this interface,
// never mutating account state directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;

use super::{Account, AccountStatus};
use crate::auth::types::Credentials;

pub trait AccountStore: Send + Sync {
    /// Snapshot of all known accounts. Cheap, synchronous, never blocks on I/O.
    fn snapshot(&self) -> Vec<Account>;

    fn update_status(
        &self,
        account_id: &str,
        status: AccountStatus,
        quota_exhausted_until: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> BoxFuture<'_, anyhow::Result<()>>;

    fn update_credentials(
        &self,
        account_id: &str,
        credentials: Credentials,
    ) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Adds a new account to the pool, or replaces an existing one with the
    /// same id. Used by the admin API to grow the pool at runtime.
    fn add_account(&self, account: Account) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Removes an account from the pool. Used by the admin API. A removal of
    /// an unknown id is not an error.
    fn remove_account(&self, account_id: &str) -> BoxFuture<'_, anyhow::Result<()>>;
}

/// Built-in account store for standalone use with no injected backend.
///
/// Watches a directory of `kiro-auth-token.json` / device-registration JSON
/// pairs the way kiro-cli's SQLite db does, one pair per account subdirectory.
/// Updates are in-memory only; `last_error`/status/credential changes are not
/// written back to disk (a host embedding its own persistent store should
/// implement `AccountStore` itself instead of using this one).
pub struct FileAccountStore {
    accounts: Arc<DashMap<String, Account>>,
    #[allow(dead_code)]
    root: PathBuf,
}

impl FileAccountStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            accounts: Arc::new(DashMap::new()),
            root,
        }
    }

    /// Load one account directly (used by tests and by the single-SQLite-file
    /// startup path that predates multi-account support).
    pub fn insert(&self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }

    /// Scans `root` for one subdirectory per account, each containing a
    /// `kiro-auth-token.json` and `kiro-device-registration.json`.
    pub async fn load_from_dir(root: &Path) -> anyhow::Result<Self> {
        let store = Self::new(root.to_path_buf());

        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    "Account directory {} not readable ({}), starting with an empty pool",
                    root.display(),
                    e
                );
                return Ok(store);
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let token_path = path.join("kiro-auth-token.json");
            let registration_path = path.join("kiro-device-registration.json");

            if !token_path.exists() {
                continue;
            }

            match load_account_dir(&path, &token_path, &registration_path).await {
                Ok(account) => {
                    tracing::info!("Loaded account {} from {}", account.id, path.display());
                    store.insert(account);
                }
                Err(e) => {
                    tracing::warn!("Skipping account directory {}: {}", path.display(), e);
                }
            }
        }

        Ok(store)
    }
}

async fn load_account_dir(
    dir: &Path,
    token_path: &Path,
    registration_path: &Path,
) -> anyhow::Result<Account> {
    let token_json = tokio::fs::read_to_string(token_path).await?;

    let registration_json = if registration_path.exists() {
        Some(tokio::fs::read_to_string(registration_path).await?)
    } else {
        None
    };

    let id = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    account_from_json(id, &token_json, registration_json.as_deref())
}

/// Builds an `Account` from the two JSON documents a `kiro-auth-token.json` /
/// `kiro-device-registration.json` pair (or an admin-uploaded equivalent)
/// carries. Shared by directory loading and the admin add-account endpoint.
pub fn account_from_json(
    id: String,
    token_json: &str,
    registration_json: Option<&str>,
) -> anyhow::Result<Account> {
    use crate::auth::types::{SqliteDeviceRegistration, SqliteTokenData};

    let token_data: SqliteTokenData = serde_json::from_str(token_json)?;

    let registration: SqliteDeviceRegistration = match registration_json {
        Some(json) => serde_json::from_str(json)?,
        None => SqliteDeviceRegistration {
            client_id: None,
            client_secret: None,
            region: None,
        },
    };

    let refresh_token = token_data
        .refresh_token
        .ok_or_else(|| anyhow::anyhow!("missing refreshToken"))?;

    let expires_at = token_data
        .expires_at
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let sso_region = token_data.region.or(registration.region);

    let credentials = Credentials {
        refresh_token,
        access_token: token_data.access_token,
        expires_at,
        profile_arn: None,
        region: "us-east-1".to_string(),
        client_id: registration.client_id,
        client_secret: registration.client_secret,
        sso_region,
        scopes: token_data.scopes,
    };

    Ok(Account::new(id.clone(), id, credentials))
}

impl AccountStore for FileAccountStore {
    fn snapshot(&self) -> Vec<Account> {
        self.accounts.iter().map(|e| e.value().clone()).collect()
    }

    fn update_status(
        &self,
        account_id: &str,
        status: AccountStatus,
        quota_exhausted_until: Option<DateTime<Utc>>,
        last_error: Option<String>,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            if let Some(mut entry) = self.accounts.get_mut(&account_id) {
                entry.status = status;
                entry.quota_exhausted_until = quota_exhausted_until;
                if last_error.is_some() {
                    entry.last_error = last_error;
                }
            }
            Ok(())
        })
    }

    fn update_credentials(
        &self,
        account_id: &str,
        credentials: Credentials,
    ) -> BoxFuture<'_, anyhow::Result<()>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            if let Some(mut entry) = self.accounts.get_mut(&account_id) {
                entry.credentials = credentials;
            }
            Ok(())
        })
    }

    fn add_account(&self, account: Account) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.insert(account);
            Ok(())
        })
    }

    fn remove_account(&self, account_id: &str) -> BoxFuture<'_, anyhow::Result<()>> {
        let account_id = account_id.to_string();
        Box::pin(async move {
            self.accounts.remove(&account_id);
            Ok(())
        })
    }
}
