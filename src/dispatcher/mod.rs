// Account pool dispatcher: round-robin selection, cooldown tracking, and
// per-error disposition.
//
// The cursor and cooldown map are guarded by one mutex. Every read that
// drives selection happens under that lock; the chosen account is cloned out
// before any await-ed work begins, matching the locking discipline used
// elsewhere for session/router state (never hold a lock across an await).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use tokio::sync::Mutex;

use crate::accounts::{Account, AccountStatus, AccountStore};

/// Outcome of a single adapter attempt against one account.
pub enum Disposition<T> {
    Success(T),
    /// No HTTP status observed (local/network failure). Abort immediately,
    /// no cooldown.
    Local(String),
    /// HTTP 400: request-shape bug. Abort immediately, no cooldown, no
    /// failover.
    BadRequest(String),
    /// HTTP 402: the account's quota is exhausted for the rest of the
    /// billing period.
    QuotaExhausted,
    /// 401/403/429/5xx/anything else upstream-attributable: cooldown this
    /// account and try the next one.
    Retryable { status: u16, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No healthy accounts available")]
    NoHealthyAccounts,
    #[error("{0}")]
    Local(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{message}")]
    Exhausted {
        attempts: usize,
        last_status: Option<u16>,
        message: String,
    },
}

struct DispatcherState {
    round_robin_cursor: usize,
    cooldowns: HashMap<String, DateTime<Utc>>,
}

/// Selects an eligible account per inbound request, drives the adapter call
/// the caller provides, classifies failures, and updates cooldown/quota
/// state through the injected `AccountStore`.
pub struct AccountPoolDispatcher {
    store: Arc<dyn AccountStore>,
    state: Mutex<DispatcherState>,
    cooldown_ms: i64,
    quota_reset_utc: bool,
}

impl AccountPoolDispatcher {
    pub fn new(store: Arc<dyn AccountStore>, cooldown_ms: i64, quota_reset_utc: bool) -> Self {
        Self {
            store,
            state: Mutex::new(DispatcherState {
                round_robin_cursor: 0,
                cooldowns: HashMap::new(),
            }),
            cooldown_ms,
            quota_reset_utc,
        }
    }

    /// Accounts with a refresh token, not administratively disabled, whose
    /// cooldown (if any) has expired, and either not quota-exhausted or
    /// whose exhaustion window has elapsed (in which case the store is
    /// asked to reset status back to active).
    async fn eligible_accounts(&self) -> Vec<Account> {
        let now = Utc::now();
        let all = self.store.snapshot();

        let eligible: Vec<Account> = {
            let mut state = self.state.lock().await;
            state.cooldowns.retain(|_, until| *until > now);

            all.into_iter()
                .filter(|a| a.is_usable())
                .filter(|a| a.status != AccountStatus::Disabled)
                .filter(|a| !state.cooldowns.contains_key(&a.id))
                .filter(|a| match a.status {
                    AccountStatus::QuotaExhausted => a
                        .quota_exhausted_until
                        .map(|until| until <= now)
                        .unwrap_or(true),
                    _ => true,
                })
                .collect()
        };

        for account in &eligible {
            if account.status == AccountStatus::QuotaExhausted {
                let _ = self
                    .store
                    .update_status(&account.id, AccountStatus::Active, None, None)
                    .await;
            }
        }

        eligible
    }

    /// Runs `call` against eligible accounts in round-robin order until one
    /// succeeds, a non-retryable disposition is returned, or the pool is
    /// exhausted. The cursor advances by one on every attempt, including
    /// ones that end up retryable, so fairness holds across failing and
    /// succeeding requests alike.
    pub async fn dispatch<T, F, Fut>(&self, mut call: F) -> Result<T, DispatchError>
    where
        F: FnMut(Account) -> Fut,
        Fut: Future<Output = Disposition<T>>,
    {
        let eligible = self.eligible_accounts().await;
        if eligible.is_empty() {
            return Err(DispatchError::NoHealthyAccounts);
        }

        let start = {
            let state = self.state.lock().await;
            state.round_robin_cursor % eligible.len()
        };

        let mut last_status: Option<u16> = None;
        let mut last_message = String::new();

        for attempt in 0..eligible.len() {
            let index = (start + attempt) % eligible.len();
            let account = eligible[index].clone();
            let account_id = account.id.clone();

            {
                let mut state = self.state.lock().await;
                state.round_robin_cursor = (index + 1) % eligible.len();
            }

            match call(account).await {
                Disposition::Success(value) => return Ok(value),
                Disposition::Local(message) => return Err(DispatchError::Local(message)),
                Disposition::BadRequest(message) => return Err(DispatchError::BadRequest(message)),
                Disposition::QuotaExhausted => {
                    let until = self.next_quota_reset(Utc::now());
                    let _ = self
                        .store
                        .update_status(
                            &account_id,
                            AccountStatus::QuotaExhausted,
                            Some(until),
                            Some("402 quota exhausted".to_string()),
                        )
                        .await;
                    last_status = Some(402);
                    last_message = "quota exhausted on all eligible accounts".to_string();
                }
                Disposition::Retryable { status, message } => {
                    let until = Utc::now() + chrono::Duration::milliseconds(self.cooldown_ms);
                    {
                        let mut state = self.state.lock().await;
                        state.cooldowns.insert(account_id.clone(), until);
                    }
                    let _ = self
                        .store
                        .update_status(&account_id, AccountStatus::Error, None, Some(message.clone()))
                        .await;
                    last_status = Some(status);
                    last_message = message;
                }
            }
        }

        Err(DispatchError::Exhausted {
            attempts: eligible.len(),
            last_status,
            message: last_message,
        })
    }

    fn next_quota_reset(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        if self.quota_reset_utc {
            next_month_start_utc(from)
        } else {
            let local = from.with_timezone(&chrono::Local);
            let (year, month) = next_month(local.year(), local.month());
            chrono::Local
                .with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or(from)
        }
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn next_month_start_utc(from: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = next_month(from.year(), from.month());
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::FileAccountStore;
    use crate::auth::types::Credentials;
    use std::path::PathBuf;

    fn creds() -> Credentials {
        Credentials {
            refresh_token: "refresh".to_string(),
            access_token: Some("token".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            profile_arn: None,
            region: "us-east-1".to_string(),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            sso_region: None,
            scopes: None,
        }
    }

    fn pool_of(n: usize) -> (Arc<FileAccountStore>, AccountPoolDispatcher) {
        let store = Arc::new(FileAccountStore::new(PathBuf::from("/tmp/nonexistent")));
        for i in 0..n {
            store.insert(Account::new(format!("a{i}"), format!("a{i}@x.com"), creds()));
        }
        let dispatcher = AccountPoolDispatcher::new(store.clone(), 60_000, false);
        (store, dispatcher)
    }

    #[tokio::test]
    async fn test_no_accounts_returns_no_healthy() {
        let store = Arc::new(FileAccountStore::new(PathBuf::from("/tmp/nonexistent")));
        let dispatcher = AccountPoolDispatcher::new(store, 60_000, false);

        let result = dispatcher
            .dispatch(|_account| async { Disposition::Success(1) })
            .await;

        assert!(matches!(result, Err(DispatchError::NoHealthyAccounts)));
    }

    #[tokio::test]
    async fn test_round_robin_fairness() {
        let (_store, dispatcher) = pool_of(3);
        let mut counts: HashMap<String, u32> = HashMap::new();

        for _ in 0..9 {
            let id = dispatcher
                .dispatch(|account| async move { Disposition::Success(account.id) })
                .await
                .unwrap();
            *counts.entry(id).or_insert(0) += 1;
        }

        let min = *counts.values().min().unwrap();
        let max = *counts.values().max().unwrap();
        assert_eq!(counts.len(), 3);
        assert!(max - min <= 1);
    }

    #[tokio::test]
    async fn test_retryable_triggers_cooldown_and_failover() {
        let (_store, dispatcher) = pool_of(2);

        let result = dispatcher
            .dispatch(|account| async move {
                if account.id == "a0" {
                    Disposition::Retryable {
                        status: 429,
                        message: "rate limited".to_string(),
                    }
                } else {
                    Disposition::Success(account.id)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "a1");

        // a0 is now in cooldown: every subsequent dispatch must land on a1.
        for _ in 0..3 {
            let id = dispatcher
                .dispatch(|account| async move { Disposition::Success(account.id) })
                .await
                .unwrap();
            assert_eq!(id, "a1");
        }
    }

    #[tokio::test]
    async fn test_all_cooldown_returns_no_healthy() {
        let (_store, dispatcher) = pool_of(2);

        let result = dispatcher
            .dispatch(|_account| async move {
                Disposition::Retryable {
                    status: 500,
                    message: "boom".to_string(),
                }
            })
            .await;
        assert!(matches!(result, Err(DispatchError::Exhausted { .. })));

        let result = dispatcher
            .dispatch(|_account| async { Disposition::Success(()) })
            .await;
        assert!(matches!(result, Err(DispatchError::NoHealthyAccounts)));
    }

    #[tokio::test]
    async fn test_quota_exhausted_skips_account_until_reset() {
        let (store, dispatcher) = pool_of(2);

        let result = dispatcher
            .dispatch(|account| async move {
                if account.id == "a0" {
                    Disposition::QuotaExhausted
                } else {
                    Disposition::Success(account.id)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, "a1");

        let a0 = store
            .snapshot()
            .into_iter()
            .find(|a| a.id == "a0")
            .unwrap();
        assert_eq!(a0.status, AccountStatus::QuotaExhausted);
        assert!(a0.quota_exhausted_until.is_some());
    }

    #[tokio::test]
    async fn test_local_error_aborts_without_cooldown() {
        let (_store, dispatcher) = pool_of(2);

        let result = dispatcher
            .dispatch(|_account| async { Disposition::Local("connection reset".to_string()) })
            .await;
        assert!(matches!(result, Err(DispatchError::Local(_))));

        // No cooldown should have been recorded: both accounts remain eligible.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2 {
            let id = dispatcher
                .dispatch(|account| async move { Disposition::Success(account.id) })
                .await
                .unwrap();
            seen.insert(id);
        }
        assert_eq!(seen.len(), 2);
    }
}
