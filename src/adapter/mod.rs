// Per-account Kiro adapter: owns a keyed connection pool, signs requests with
// a bit-exact user-agent, refreshes credentials on demand, and retries on
// classified upstream errors. Generalizes the teacher's single-account
// `KiroHttpClient` to operate against whichever `Account` the dispatcher
// selects for a given attempt.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::{Client, Response};
use sha2::{Digest, Sha256};

use crate::accounts::{Account, AccountStore};
use crate::auth::refresh;
use crate::auth::types::AuthType;

/// Kiro pins its own client version into the user-agent; upstream inspects
/// this string, so it must match exactly what a real Kiro IDE install sends.
const KIRO_VERSION: &str = "0.7.45";
const NODE_VERSION: &str = "18.18.2";

const BASH_TOOL_DESCRIPTION_OVERRIDE: &str =
    "Execute a bash command and return its output.";

pub struct AdapterError {
    pub status: Option<u16>,
    pub message: String,
}

/// Builds and caches one `reqwest::Client` per account id so keep-alive
/// connections are reused across requests instead of being torn down with
/// each short-lived adapter call.
pub struct KiroAdapter {
    clients: DashMap<String, Client>,
    connect_timeout: u64,
    request_timeout: u64,
    max_retries: u32,
}

impl KiroAdapter {
    pub fn new(connect_timeout: u64, request_timeout: u64, max_retries: u32) -> Self {
        Self {
            clients: DashMap::new(),
            connect_timeout,
            request_timeout,
            max_retries,
        }
    }

    fn client_for(&self, account_id: &str) -> Client {
        if let Some(client) = self.clients.get(account_id) {
            return client.clone();
        }

        let client = Client::builder()
            .pool_max_idle_per_host(100)
            .connect_timeout(Duration::from_secs(self.connect_timeout))
            .timeout(Duration::from_secs(self.request_timeout))
            .build()
            .expect("failed to build Kiro HTTP client");

        self.clients
            .insert(account_id.to_string(), client.clone());
        client
    }

    fn generate_endpoint(&self, region: &str, model: &str) -> String {
        if model.starts_with("amazonq") {
            format!("https://codewhisperer.{}.amazonaws.com/SendMessageStreaming", region)
        } else {
            format!(
                "https://codewhisperer.{}.amazonaws.com/generateAssistantResponse",
                region
            )
        }
    }

    pub fn usage_limits_endpoint(&self, account: &Account) -> String {
        let region = &account.credentials.region;
        let mut url = format!(
            "https://q.{}.amazonaws.com/getUsageLimits?isEmailRequired=true&origin=AI_EDITOR&resourceType=AGENTIC_REQUEST",
            region
        );
        if account.auth_type == AuthType::KiroDesktop {
            if let Some(profile_arn) = &account.credentials.profile_arn {
                url.push_str(&format!("&profileArn={}", profile_arn));
            }
        }
        url
    }

    /// Ensures the account's credentials are fresh, sends `payload` to the
    /// endpoint selected by `model`, retries a 403 once after a forced
    /// refresh, and retries 429/5xx with exponential backoff. Returns the
    /// raw streaming response on success; the dispatcher maps `AdapterError`
    /// into a `Disposition`.
    pub async fn send(
        &self,
        account: &mut Account,
        store: &Arc<dyn AccountStore>,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<Response, AdapterError> {
        let payload = sanitize_tool_descriptions(payload);
        let client = self.client_for(&account.id);

        ensure_fresh(account, store, &client).await?;

        let url = self.generate_endpoint(&account.credentials.region, model);
        let mut attempt = 0;
        let mut forced_refresh = false;

        loop {
            let access_token = account
                .credentials
                .access_token
                .clone()
                .ok_or_else(|| AdapterError {
                    status: None,
                    message: "no access token available".to_string(),
                })?;

            let request = client
                .post(&url)
                .header("Authorization", format!("Bearer {}", access_token))
                .header("Content-Type", "application/json")
                .header("User-Agent", build_user_agent(account))
                .header("x-amz-user-agent", build_amz_user_agent(account))
                .json(&payload)
                .build()
                .map_err(|e| AdapterError {
                    status: None,
                    message: format!("failed to build request: {}", e),
                })?;

            let result = client.execute(request).await;

            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();

                    if status == 403 && !forced_refresh {
                        tracing::warn!(
                            "Account {} received 403, forcing refresh and retrying once",
                            account.id
                        );
                        forced_refresh = true;
                        if let Err(e) = force_refresh(account, store, &client).await {
                            return Err(e);
                        }
                        continue;
                    }

                    if matches!(status, 429 | 500..=599) && attempt < self.max_retries {
                        let delay = backoff_delay(attempt);
                        tracing::warn!(
                            "Account {} received {}, retrying after {}ms (attempt {}/{})",
                            account.id,
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let message = response.text().await.unwrap_or_default();
                    return Err(AdapterError {
                        status: Some(status),
                        message,
                    });
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let delay = backoff_delay(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AdapterError {
                        status: None,
                        message: e.to_string(),
                    });
                }
            }
        }
    }
    /// Queries `getUsageLimits` for one account, refreshing its credentials
    /// first if needed. Used by the admin usage-refresh endpoint; not on the
    /// hot request path.
    pub async fn fetch_usage_limits(
        &self,
        account: &mut Account,
        store: &Arc<dyn AccountStore>,
    ) -> Result<serde_json::Value, AdapterError> {
        let client = self.client_for(&account.id);
        ensure_fresh(account, store, &client).await?;

        let access_token = account
            .credentials
            .access_token
            .clone()
            .ok_or_else(|| AdapterError {
                status: None,
                message: "no access token available".to_string(),
            })?;

        let url = self.usage_limits_endpoint(account);

        let response = client
            .get(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .header("User-Agent", build_user_agent(account))
            .header("x-amz-user-agent", build_amz_user_agent(account))
            .send()
            .await
            .map_err(|e| AdapterError {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdapterError {
                status: Some(status.as_u16()),
                message,
            });
        }

        response.json::<serde_json::Value>().await.map_err(|e| AdapterError {
            status: None,
            message: format!("failed to parse usage limits response: {}", e),
        })
    }
}

async fn ensure_fresh(
    account: &mut Account,
    store: &Arc<dyn AccountStore>,
    client: &Client,
) -> Result<(), AdapterError> {
    let needs_refresh = account.credentials.access_token.is_none()
        || account
            .credentials
            .expires_at
            .map(|exp| exp <= chrono::Utc::now() + chrono::Duration::seconds(300))
            .unwrap_or(true);

    if needs_refresh {
        force_refresh(account, store, client).await?;
    }

    Ok(())
}

async fn force_refresh(
    account: &mut Account,
    store: &Arc<dyn AccountStore>,
    client: &Client,
) -> Result<(), AdapterError> {
    let token_data = refresh::refresh_with_retry(
        client,
        account.auth_type.clone(),
        &mut account.credentials,
        None,
    )
    .await
    .map_err(|e| AdapterError {
        status: None,
        message: format!("credential refresh failed: {}", e),
    })?;

    account.credentials.access_token = Some(token_data.access_token);
    account.credentials.expires_at = Some(token_data.expires_at);
    if let Some(refresh_token) = token_data.refresh_token {
        account.credentials.refresh_token = refresh_token;
    }
    if let Some(profile_arn) = token_data.profile_arn {
        account.credentials.profile_arn = Some(profile_arn);
    }

    let _ = store
        .update_credentials(&account.id, account.credentials.clone())
        .await;

    Ok(())
}

fn backoff_delay(attempt: u32) -> u64 {
    let base = 1000u64;
    let delay = base * 2_u64.pow(attempt);
    let jitter = (delay as f64 * 0.1 * pseudo_random()) as u64;
    delay + jitter
}

fn pseudo_random() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    std::time::SystemTime::now().hash(&mut hasher);
    (hasher.finish() % 1000) as f64 / 1000.0
}

/// `machineId` is the hex SHA-256 of the first non-empty of the account's
/// uuid-like identifiers. Upstream inspects the user-agent bit-exactly, so
/// this must be deterministic per account.
fn machine_id(account: &Account) -> String {
    let seed = [
        Some(account.id.as_str()),
        account.credentials.profile_arn.as_deref(),
        account.credentials.client_id.as_deref(),
    ]
    .into_iter()
    .flatten()
    .find(|s| !s.is_empty())
    .unwrap_or("unknown-machine");

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn build_user_agent(account: &Account) -> String {
    format!(
        "aws-sdk-js/1.0.0 ua/2.1 os/{}#unknown lang/js md/nodejs#{} api/codewhispererruntime#1.0.0 m/E KiroIDE-{}-{}",
        std::env::consts::OS,
        NODE_VERSION,
        KIRO_VERSION,
        machine_id(account)
    )
}

fn build_amz_user_agent(account: &Account) -> String {
    format!(
        "aws-sdk-js/1.0.0 KiroIDE-{}-{}",
        KIRO_VERSION,
        machine_id(account)
    )
}

/// Upstream rejects the bundled Claude Code `Bash` tool description for being
/// oversized; swap it for a short canonical one before sending.
fn sanitize_tool_descriptions(payload: &serde_json::Value) -> serde_json::Value {
    let mut payload = payload.clone();

    let tools = payload
        .pointer_mut("/conversationState/currentMessage/userInputMessage/userInputMessageContext/tools")
        .and_then(|v| v.as_array_mut());

    if let Some(tools) = tools {
        for tool in tools.iter_mut() {
            let spec = tool.get_mut("toolSpecification");
            if let Some(spec) = spec {
                let is_bash = spec.get("name").and_then(|v| v.as_str()) == Some("Bash");
                let has_claude_code_text = spec
                    .get("description")
                    .and_then(|v| v.as_str())
                    .map(|d| d.contains("Claude Code"))
                    .unwrap_or(false);

                if is_bash && has_claude_code_text {
                    if let Some(obj) = spec.as_object_mut() {
                        obj.insert(
                            "description".to_string(),
                            serde_json::Value::String(BASH_TOOL_DESCRIPTION_OVERRIDE.to_string()),
                        );
                    }
                }
            }
        }
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::Credentials;

    fn test_account() -> Account {
        Account::new(
            "acc-1".to_string(),
            "a@example.com".to_string(),
            Credentials {
                refresh_token: "refresh".to_string(),
                access_token: Some("token".to_string()),
                expires_at: Some(chrono::Utc::now() + chrono::Duration::hours(1)),
                profile_arn: None,
                region: "us-east-1".to_string(),
                client_id: Some("client".to_string()),
                client_secret: Some("secret".to_string()),
                sso_region: None,
                scopes: None,
            },
        )
    }

    #[test]
    fn test_machine_id_deterministic() {
        let account = test_account();
        assert_eq!(machine_id(&account), machine_id(&account));
        assert_eq!(machine_id(&account).len(), 64);
    }

    #[test]
    fn test_user_agent_contains_machine_id_and_version() {
        let account = test_account();
        let ua = build_user_agent(&account);
        assert!(ua.contains(KIRO_VERSION));
        assert!(ua.contains(&machine_id(&account)));
        assert!(ua.starts_with("aws-sdk-js/1.0.0"));
    }

    #[test]
    fn test_endpoint_selection_by_model_prefix() {
        let adapter = KiroAdapter::new(30, 300, 3);
        assert!(adapter
            .generate_endpoint("us-east-1", "amazonq-default")
            .ends_with("SendMessageStreaming"));
        assert!(adapter
            .generate_endpoint("us-east-1", "CLAUDE_SONNET_4_5")
            .ends_with("generateAssistantResponse"));
    }

    #[test]
    fn test_sanitize_bash_tool_with_claude_code_description() {
        let payload = serde_json::json!({
            "conversationState": {
                "currentMessage": {
                    "userInputMessage": {
                        "userInputMessageContext": {
                            "tools": [{
                                "toolSpecification": {
                                    "name": "Bash",
                                    "description": "Runs commands for Claude Code sessions",
                                    "inputSchema": {}
                                }
                            }]
                        }
                    }
                }
            }
        });

        let sanitized = sanitize_tool_descriptions(&payload);
        let desc = sanitized
            .pointer("/conversationState/currentMessage/userInputMessage/userInputMessageContext/tools/0/toolSpecification/description")
            .and_then(|v| v.as_str())
            .unwrap();
        assert_eq!(desc, BASH_TOOL_DESCRIPTION_OVERRIDE);
    }

    #[test]
    fn test_sanitize_leaves_other_tools_untouched() {
        let payload = serde_json::json!({
            "conversationState": {
                "currentMessage": {
                    "userInputMessage": {
                        "userInputMessageContext": {
                            "tools": [{
                                "toolSpecification": {
                                    "name": "lookup",
                                    "description": "Looks things up",
                                    "inputSchema": {}
                                }
                            }]
                        }
                    }
                }
            }
        });

        let sanitized = sanitize_tool_descriptions(&payload);
        let desc = sanitized
            .pointer("/conversationState/currentMessage/userInputMessage/userInputMessageContext/tools/0/toolSpecification/description")
            .and_then(|v| v.as_str())
            .unwrap();
        assert_eq!(desc, "Looks things up");
    }
}
