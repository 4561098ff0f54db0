// Account pool data model
// An Account wraps one set of Kiro credentials plus the health state the
// dispatcher needs to decide whether it is eligible for the next request.

mod store;

pub use store::{account_from_json, AccountStore, FileAccountStore};

use chrono::{DateTime, Utc};

use crate::auth::types::{AuthType, Credentials};

/// Health state of a single account, as tracked by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    QuotaExhausted,
    Error,
    Disabled,
}

/// One Kiro account in the pool.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub display_email: String,
    pub credentials: Credentials,
    pub auth_type: AuthType,
    pub status: AccountStatus,
    pub last_error: Option<String>,
    pub quota_exhausted_until: Option<DateTime<Utc>>,
}

impl Account {
    pub fn new(id: String, display_email: String, credentials: Credentials) -> Self {
        let auth_type = crate::auth::credentials::detect_auth_type(&credentials);
        Self {
            id,
            display_email,
            credentials,
            auth_type,
            status: AccountStatus::Active,
            last_error: None,
            quota_exhausted_until: None,
        }
    }

    /// True if this account has a refresh token and can therefore be used at all.
    pub fn is_usable(&self) -> bool {
        !self.credentials.refresh_token.is_empty()
    }
}
