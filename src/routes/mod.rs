use axum::{
    body::Body,
    extract::{Multipart, Query, State},
    middleware::{self as axum_middleware},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::accounts::{account_from_json, Account, AccountStatus, AccountStore};
use crate::adapter::{AdapterError, KiroAdapter};
use crate::auth::types::AuthType;
use crate::cache::ModelCache;
use crate::config::Config;
use crate::converters::anthropic_to_kiro::build_kiro_payload as build_kiro_payload_anthropic;
use crate::converters::openai_to_kiro::build_kiro_payload;
use crate::dispatcher::{AccountPoolDispatcher, Disposition};
use crate::error::ApiError;
use crate::metrics::MetricsCollector;
use crate::middleware;
use crate::middleware::DEBUG_LOGGER;
use crate::models::anthropic::AnthropicMessagesRequest;
use crate::models::openai::{ChatCompletionRequest, ModelList, OpenAIModel};
use crate::resolver::ModelResolver;
use crate::tokenizer::{
    count_anthropic_message_tokens, count_message_tokens, count_tools_tokens, CLAUDE_TOOL_OVERHEAD,
};
use std::time::Instant;

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Proxy-facing settings the admin API can flip at runtime. The listening
/// socket itself can't be rebound mid-process, so `enabled`/`port` here are
/// advisory state surfaced to the admin UI, not a live re-bind.
#[derive(Clone, Debug, serde::Serialize)]
pub struct AdminProxySettings {
    pub enabled: bool,
    pub port: u16,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub proxy_api_key: Arc<RwLock<String>>,
    pub admin_proxy_settings: Arc<RwLock<AdminProxySettings>>,
    pub model_cache: ModelCache,
    pub resolver: ModelResolver,
    pub config: Arc<Config>,
    pub metrics: Arc<MetricsCollector>,
    pub store: Arc<dyn AccountStore>,
    pub adapter: Arc<KiroAdapter>,
    pub dispatcher: Arc<AccountPoolDispatcher>,
    /// Last-fetched usage limits per account id, populated by the admin
    /// usage-refresh endpoint.
    pub usage_cache: Arc<dashmap::DashMap<String, Value>>,
}

/// Guard to ensure active connections are decremented on drop
struct RequestGuard {
    metrics: Arc<MetricsCollector>,
    start_time: Instant,
    model: String,
    completed: bool,
}

impl RequestGuard {
    fn new(metrics: Arc<MetricsCollector>, model: String) -> Self {
        metrics.record_request_start();
        Self {
            metrics,
            start_time: Instant::now(),
            model,
            completed: false,
        }
    }

    fn complete(&mut self, input_tokens: u64, output_tokens: u64) {
        if !self.completed {
            let latency_ms = self.start_time.elapsed().as_secs_f64() * 1000.0;
            self.metrics
                .record_request_end(latency_ms, &self.model, input_tokens, output_tokens);
            self.completed = true;
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.completed {
            self.metrics.record_request_abort();
        }
    }
}

fn error_type_from_api_error(err: &ApiError) -> &'static str {
    match err {
        ApiError::AuthError(_) => "auth",
        ApiError::ValidationError(_) => "validation",
        ApiError::KiroApiError { .. } => "upstream",
        ApiError::Internal(_) => "internal",
        ApiError::InvalidModel(_) => "validation",
        ApiError::ConfigError(_) => "config",
        ApiError::NoHealthyAccounts(_) => "no_healthy_accounts",
        ApiError::UpstreamUnavailable(_) => "upstream_unavailable",
    }
}

/// Maps an adapter-level failure onto the dispatcher's retry taxonomy, per
/// the upstream status-code table: no status is a local/network failure
/// (abort), 400 is a request-shape bug (abort, no failover), 402 means the
/// account's quota is exhausted for the billing period, anything else is
/// attributable to the account and should cool down before failover.
fn classify_adapter_error<T>(err: AdapterError) -> Disposition<T> {
    match err.status {
        None => Disposition::Local(err.message),
        Some(400) => Disposition::BadRequest(err.message),
        Some(402) => Disposition::QuotaExhausted,
        Some(status) => Disposition::Retryable {
            status,
            message: err.message,
        },
    }
}

/// Runs `build_payload` against each account the dispatcher offers until one
/// succeeds, classifying adapter failures into retry dispositions along the
/// way. `build_payload` is re-invoked per attempt so each account's own
/// `profileArn`/auth method can be reflected in its own request body.
async fn dispatch_kiro_request(
    state: &AppState,
    model_for_endpoint: String,
    build_payload: Arc<dyn Fn(&Account) -> Result<Value, String> + Send + Sync>,
) -> Result<Response, ApiError> {
    let store = Arc::clone(&state.store);
    let adapter = Arc::clone(&state.adapter);
    let metrics = Arc::clone(&state.metrics);

    state
        .dispatcher
        .dispatch(move |mut account| {
            let store = Arc::clone(&store);
            let adapter = Arc::clone(&adapter);
            let metrics = Arc::clone(&metrics);
            let model_for_endpoint = model_for_endpoint.clone();
            let build_payload = Arc::clone(&build_payload);

            async move {
                let payload = match build_payload(&account) {
                    Ok(payload) => payload,
                    Err(message) => return Disposition::BadRequest(message),
                };

                match adapter
                    .send(&mut account, &store, &model_for_endpoint, &payload)
                    .await
                {
                    Ok(response) => {
                        metrics.record_account_dispatch(&account.id, true);
                        Disposition::Success(response)
                    }
                    Err(err) => {
                        metrics.record_account_dispatch(&account.id, false);
                        classify_adapter_error(err)
                    }
                }
            }
        })
        .await
        .map_err(crate::error::dispatch_error_to_api)
}

/// Builds a synthetic SSE "warning" event. Framed with its own `event:` name
/// so clients that switch on event type won't mistake it for a protocol
/// content event; clients that don't look at it can ignore an unrecognized
/// event name.
fn warning_sse_frame(message: &str) -> Bytes {
    Bytes::from(format!(
        "event: warning\ndata: {}\n\n",
        json!({"type": "warning", "message": message})
    ))
}

/// Returns a warning when the estimated prompt size is within range of
/// typical upstream context limits, so large requests that are likely to
/// fail or be truncated don't do so silently.
fn context_length_warning(input_tokens: i32, config: &Config) -> Option<String> {
    let tokens = input_tokens.max(0) as u32;
    if tokens >= config.context_hard_warning_tokens {
        Some(format!(
            "Estimated prompt size ({} tokens) is at or beyond the typical hard context limit ({} tokens); this request is likely to fail or be truncated upstream.",
            tokens, config.context_hard_warning_tokens
        ))
    } else if tokens >= config.context_warning_tokens {
        Some(format!(
            "Estimated prompt size ({} tokens) is approaching typical context limits ({} tokens).",
            tokens, config.context_warning_tokens
        ))
    } else {
        None
    }
}

fn openai_include_usage(request: &ChatCompletionRequest) -> bool {
    request
        .stream_options
        .as_ref()
        .and_then(|opts| opts.get("include_usage"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// OpenAI API routes (require authentication)
pub fn openai_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(get_models_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Anthropic API routes (require authentication)
pub fn anthropic_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(anthropic_messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// Admin JSON routes (require authentication). The browser-based admin
/// portal itself is a static asset shipped outside this crate; only the JSON
/// endpoints it calls live here.
pub fn admin_routes(state: AppState) -> Router {
    Router::new()
        .route("/admin", get(admin_index_handler))
        .route("/admin/data", get(admin_data_handler))
        .route("/admin/proxy", post(admin_update_proxy_handler))
        .route("/admin/account", post(admin_add_account_handler))
        .route("/admin/account", delete(admin_remove_account_handler))
        .route("/admin/usage/refresh", post(admin_refresh_usage_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// GET / - Simple health check
///
/// Returns basic status and version information.
/// This endpoint does not require authentication (for load balancers).
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Kiro Gateway is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
///
/// Returns detailed health information including timestamp.
/// This endpoint does not require authentication (for load balancers).
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /v1/models - List available models
///
/// Returns a list of available models in OpenAI format.
/// Models are loaded from the cache (populated at startup).
async fn get_models_handler(State(state): State<AppState>) -> Result<Json<ModelList>, ApiError> {
    tracing::info!("Request to /v1/models");

    let model_ids = state.model_cache.get_all_model_ids();

    let models: Vec<OpenAIModel> = model_ids
        .into_iter()
        .map(|id| {
            let mut model = OpenAIModel::new(id);
            model.description = Some("Claude model via Kiro API".to_string());
            model
        })
        .collect();

    Ok(Json(ModelList::new(models)))
}

/// POST /v1/chat/completions - Create chat completion
///
/// Handles both streaming and non-streaming chat completion requests.
/// Converts OpenAI format to Kiro format, dispatches the request across the
/// account pool, and converts the response back.
async fn chat_completions_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    tracing::info!(
        "Request to /v1/chat/completions: model={}, stream={}, messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );

    if request.messages.is_empty() {
        let err = ApiError::ValidationError("messages cannot be empty".to_string());
        state.metrics.record_error(error_type_from_api_error(&err));
        return Err(err);
    }

    let resolution = state.resolver.resolve(&request.model);
    let model_id = resolution.internal_id.clone();

    let mut guard = RequestGuard::new(Arc::clone(&state.metrics), model_id.clone());

    tracing::debug!(
        "Model resolution: {} -> {} (source: {}, verified: {})",
        request.model,
        model_id,
        resolution.source,
        resolution.is_verified
    );

    let input_tokens = count_message_tokens(&request.messages, false)
        + count_tools_tokens(request.tools.as_ref(), false);
    let warning = context_length_warning(input_tokens, &state.config);
    if let Some(message) = &warning {
        tracing::warn!("{}", message);
    }

    let conversation_id = Uuid::new_v4().to_string();
    let config = Arc::clone(&state.config);
    let request_for_payload = request.clone();
    let build_payload: Arc<dyn Fn(&Account) -> Result<Value, String> + Send + Sync> =
        Arc::new(move |account: &Account| {
            let profile_arn = account_profile_arn(account);
            build_kiro_payload(&request_for_payload, &conversation_id, &profile_arn, &config)
                .map(|result| result.payload)
        });

    let response = dispatch_kiro_request(&state, model_id.clone(), build_payload)
        .await
        .inspect_err(|e| state.metrics.record_error(error_type_from_api_error(e)))?;

    if request.stream {
        tracing::debug!("Handling streaming response");

        use crate::metrics::collector::StreamingMetricsTracker;

        let streaming_tracker = StreamingMetricsTracker::new(
            Arc::clone(&state.metrics),
            model_id.clone(),
            input_tokens as u64,
        );
        let output_tokens_handle = streaming_tracker.output_tokens_handle();
        let include_usage = openai_include_usage(&request);

        let openai_stream = crate::streaming::stream_kiro_to_openai(
            response,
            &request.model,
            15,
            input_tokens,
            Some(output_tokens_handle),
            include_usage,
        )
        .await
        .inspect_err(|e| state.metrics.record_error(error_type_from_api_error(e)))?;

        let converted = openai_stream.map(move |result| {
            let _tracker = &streaming_tracker;
            result
                .map(Bytes::from)
                .map_err(|e| std::io::Error::other(e.to_string()))
        });

        let warning_frame = stream::iter(warning.map(|message| Ok(warning_sse_frame(&message))));
        let byte_stream = warning_frame.chain(converted);

        let response = Response::builder()
            .status(200)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .body(Body::from_stream(byte_stream))
            .map_err(|e| {
                let err = ApiError::Internal(anyhow::anyhow!("Failed to build response: {}", e));
                state.metrics.record_error(error_type_from_api_error(&err));
                err
            })?;

        std::mem::drop(guard);
        DEBUG_LOGGER.discard_buffers().await;

        Ok(response)
    } else {
        tracing::debug!("Handling non-streaming response (collecting stream)");

        let first_token_timeout = state.config.first_token_timeout;
        let mut openai_response = crate::streaming::collect_openai_response(
            response,
            &request.model,
            first_token_timeout,
            input_tokens,
        )
        .await
        .inspect_err(|e| state.metrics.record_error(error_type_from_api_error(e)))?;

        if let Some(message) = &warning {
            openai_response["warning"] = Value::String(message.clone());
        }

        let output_tokens = openai_response
            .get("usage")
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);

        guard.complete(input_tokens as u64, output_tokens);

        DEBUG_LOGGER.discard_buffers().await;

        Ok(Json(openai_response).into_response())
    }
}

/// POST /v1/messages - Create Anthropic message
///
/// Handles both streaming and non-streaming message requests in Anthropic
/// format, dispatched across the account pool.
async fn anthropic_messages_handler(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(request): Json<AnthropicMessagesRequest>,
) -> Result<Response, ApiError> {
    tracing::info!(
        "Request to /v1/messages: model={}, stream={}, messages={}",
        request.model,
        request.stream,
        request.messages.len()
    );

    let anthropic_version = headers
        .get("anthropic-version")
        .and_then(|v| v.to_str().ok());
    if let Some(version) = anthropic_version {
        tracing::debug!("anthropic-version: {}", version);
    }

    if request.messages.is_empty() {
        let err = ApiError::ValidationError("messages cannot be empty".to_string());
        state.metrics.record_error(error_type_from_api_error(&err));
        return Err(err);
    }

    if request.max_tokens <= 0 {
        let err = ApiError::ValidationError("max_tokens must be positive".to_string());
        state.metrics.record_error(error_type_from_api_error(&err));
        return Err(err);
    }

    let resolution = state.resolver.resolve(&request.model);
    let model_id = resolution.internal_id.clone();

    let mut guard = RequestGuard::new(Arc::clone(&state.metrics), model_id.clone());

    tracing::debug!(
        "Model resolution: {} -> {} (source: {}, verified: {})",
        request.model,
        model_id,
        resolution.source,
        resolution.is_verified
    );

    let input_tokens = count_anthropic_message_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref(),
    );
    let warning = context_length_warning(input_tokens, &state.config);
    if let Some(message) = &warning {
        tracing::warn!("{}", message);
    }

    let conversation_id = Uuid::new_v4().to_string();
    let config = Arc::clone(&state.config);
    let request_for_payload = request.clone();
    let build_payload: Arc<dyn Fn(&Account) -> Result<Value, String> + Send + Sync> =
        Arc::new(move |account: &Account| {
            let profile_arn = account_profile_arn(account);
            build_kiro_payload_anthropic(&request_for_payload, &conversation_id, &profile_arn, &config)
                .map(|result| result.payload)
        });

    let response = dispatch_kiro_request(&state, model_id.clone(), build_payload)
        .await
        .inspect_err(|e| state.metrics.record_error(error_type_from_api_error(e)))?;

    if request.stream {
        tracing::debug!("Handling streaming response");

        use crate::metrics::collector::StreamingMetricsTracker;

        let streaming_tracker = StreamingMetricsTracker::new(
            Arc::clone(&state.metrics),
            model_id.clone(),
            input_tokens as u64,
        );
        let output_tokens_handle = streaming_tracker.output_tokens_handle();

        let first_token_timeout = state.config.first_token_timeout;
        let anthropic_stream = crate::streaming::stream_kiro_to_anthropic(
            response,
            &request.model,
            first_token_timeout,
            input_tokens,
            Some(output_tokens_handle),
        )
        .await
        .inspect_err(|e| state.metrics.record_error(error_type_from_api_error(e)))?;

        let converted = anthropic_stream.map(move |result| {
            let _tracker = &streaming_tracker;
            result
                .map(Bytes::from)
                .map_err(|e| std::io::Error::other(e.to_string()))
        });

        let warning_frame = stream::iter(warning.map(|message| Ok(warning_sse_frame(&message))));
        let byte_stream = warning_frame.chain(converted);

        let response = Response::builder()
            .status(200)
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .body(Body::from_stream(byte_stream))
            .map_err(|e| {
                let err = ApiError::Internal(anyhow::anyhow!("Failed to build response: {}", e));
                state.metrics.record_error(error_type_from_api_error(&err));
                err
            })?;

        std::mem::drop(guard);
        DEBUG_LOGGER.discard_buffers().await;

        Ok(response)
    } else {
        tracing::debug!("Handling non-streaming response (collecting stream)");

        let first_token_timeout = state.config.first_token_timeout;
        let mut anthropic_response = crate::streaming::collect_anthropic_response(
            response,
            &request.model,
            first_token_timeout,
            input_tokens,
        )
        .await
        .inspect_err(|e| state.metrics.record_error(error_type_from_api_error(e)))?;

        if let Some(message) = &warning {
            anthropic_response["warning"] = Value::String(message.clone());
        }

        let output_tokens = anthropic_response
            .get("usage")
            .and_then(|u| u.get("output_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);

        guard.complete(input_tokens as u64, output_tokens);

        DEBUG_LOGGER.discard_buffers().await;

        Ok(Json(anthropic_response).into_response())
    }
}

/// `profileArn` is only meaningful for Kiro Desktop ("social") accounts; AWS
/// SSO OIDC ("IdC") accounts authenticate without one.
fn account_profile_arn(account: &Account) -> String {
    if account.auth_type == AuthType::KiroDesktop {
        account.credentials.profile_arn.clone().unwrap_or_default()
    } else {
        String::new()
    }
}

/// POST /v1/messages/count_tokens - Count tokens for Anthropic message
///
/// Calculates the number of input tokens that would be used for a message
/// request without actually sending it to the API.
async fn count_tokens_handler(
    State(_state): State<AppState>,
    Json(request): Json<AnthropicMessagesRequest>,
) -> Result<Json<Value>, ApiError> {
    tracing::debug!(
        "Token count request: model={}, messages={}",
        request.model,
        request.messages.len()
    );

    let mut input_tokens = count_anthropic_message_tokens(
        &request.messages,
        request.system.as_ref(),
        request.tools.as_ref(),
    );

    if let Some(tools) = &request.tools {
        if !tools.is_empty() && request.model.starts_with("claude") {
            input_tokens += CLAUDE_TOOL_OVERHEAD;
            tracing::debug!("Added Claude tool overhead: +{} tokens", CLAUDE_TOOL_OVERHEAD);
        }
    }

    if request.model.starts_with("claude") {
        input_tokens = ((input_tokens as f64) * 1.15).round() as i32;
        tracing::debug!("Applied Claude correction factor (1.15x)");
    }

    tracing::debug!("Final token count: {}", input_tokens);

    Ok(Json(json!({
        "input_tokens": input_tokens
    })))
}

fn account_status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "active",
        AccountStatus::QuotaExhausted => "quota_exhausted",
        AccountStatus::Error => "error",
        AccountStatus::Disabled => "disabled",
    }
}

/// GET /admin - minimal landing page. The full admin single-page app is a
/// static asset served outside this crate; this page only points operators
/// at the JSON API below it.
async fn admin_index_handler() -> Html<&'static str> {
    Html(
        "<!doctype html><html><head><title>Kiro Gateway Admin</title></head>\
         <body><h1>Kiro Gateway Admin API</h1>\
         <p>JSON endpoints: GET /admin/data, POST /admin/proxy, \
         POST /admin/account, DELETE /admin/account?id=, POST /admin/usage/refresh</p>\
         </body></html>",
    )
}

/// GET /admin/data - snapshot of the account pool and current proxy settings.
async fn admin_data_handler(State(state): State<AppState>) -> Json<Value> {
    let dispatch_stats: HashMap<String, (u64, u64)> = state
        .metrics
        .get_account_dispatch_stats()
        .into_iter()
        .map(|(id, ok, err)| (id, (ok, err)))
        .collect();

    let accounts: Vec<Value> = state
        .store
        .snapshot()
        .into_iter()
        .map(|account| {
            let (successes, failures) = dispatch_stats
                .get(&account.id)
                .copied()
                .unwrap_or((0, 0));
            let usage = state.usage_cache.get(&account.id).map(|v| v.clone());
            json!({
                "id": account.id,
                "email": account.display_email,
                "authType": match account.auth_type {
                    AuthType::KiroDesktop => "social",
                    AuthType::AwsSsoOidc => "idc",
                },
                "status": account_status_str(account.status),
                "lastError": account.last_error,
                "quotaExhaustedUntil": account.quota_exhausted_until.map(|t| t.to_rfc3339()),
                "dispatchSuccesses": successes,
                "dispatchFailures": failures,
                "usage": usage,
            })
        })
        .collect();

    let proxy = state
        .admin_proxy_settings
        .read()
        .map(|settings| (*settings).clone())
        .unwrap_or(AdminProxySettings {
            enabled: true,
            port: state.config.server_port,
        });

    Json(json!({
        "accounts": accounts,
        "proxy": {
            "enabled": proxy.enabled,
            "port": proxy.port,
            "apiKeySet": state
                .proxy_api_key
                .read()
                .map(|key| !key.is_empty())
                .unwrap_or(false),
        },
    }))
}

#[derive(Deserialize)]
struct AdminProxyUpdate {
    enabled: Option<bool>,
    port: Option<u16>,
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
}

/// POST /admin/proxy - update proxy-facing settings. `port`/`enabled` are
/// recorded for the admin UI to display but cannot rebind the already-bound
/// listening socket; only `apiKey` takes effect immediately.
async fn admin_update_proxy_handler(
    State(state): State<AppState>,
    Json(update): Json<AdminProxyUpdate>,
) -> Result<Json<Value>, ApiError> {
    if let Some(enabled) = update.enabled {
        if let Ok(mut settings) = state.admin_proxy_settings.write() {
            settings.enabled = enabled;
        }
    }
    if let Some(port) = update.port {
        if let Ok(mut settings) = state.admin_proxy_settings.write() {
            settings.port = port;
        }
    }
    if let Some(api_key) = update.api_key {
        if !api_key.is_empty() {
            if let Ok(mut key) = state.proxy_api_key.write() {
                *key = api_key;
            }
        }
    }

    let proxy = state
        .admin_proxy_settings
        .read()
        .map(|settings| (*settings).clone())
        .map_err(|_| ApiError::Internal(anyhow::anyhow!("proxy settings lock poisoned")))?;

    Ok(Json(json!({
        "enabled": proxy.enabled,
        "port": proxy.port,
        "apiKeySet": state
            .proxy_api_key
            .read()
            .map(|key| !key.is_empty())
            .unwrap_or(false),
    })))
}

/// POST /admin/account - adds an account to the pool from an uploaded
/// `kiro-auth-token.json` (field `token`) and optional
/// `kiro-device-registration.json` (field `registration`), the same two
/// documents `KIRO_ACCOUNTS_DIR` subdirectories hold.
async fn admin_add_account_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut token_json: Option<String> = None;
    let mut registration_json: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::ValidationError(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        let text = field
            .text()
            .await
            .map_err(|e| ApiError::ValidationError(format!("invalid field {}: {}", name, e)))?;

        match name.as_str() {
            "token" => token_json = Some(text),
            "registration" => registration_json = Some(text),
            _ => {}
        }
    }

    let token_json = token_json
        .ok_or_else(|| ApiError::ValidationError("missing `token` field".to_string()))?;

    let id = Uuid::new_v4().to_string();
    let account = account_from_json(id, &token_json, registration_json.as_deref())
        .map_err(|e| ApiError::ValidationError(format!("invalid account data: {}", e)))?;

    let account_id = account.id.clone();
    state
        .store
        .add_account(account)
        .await
        .map_err(ApiError::Internal)?;

    Ok(Json(json!({ "id": account_id, "added": true })))
}

#[derive(Deserialize)]
struct AccountIdQuery {
    id: String,
}

/// DELETE /admin/account?id=... - removes an account from the pool.
async fn admin_remove_account_handler(
    State(state): State<AppState>,
    Query(query): Query<AccountIdQuery>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .remove_account(&query.id)
        .await
        .map_err(ApiError::Internal)?;

    Ok(Json(json!({ "id": query.id, "removed": true })))
}

/// POST /admin/usage/refresh - re-fetches `getUsageLimits` for every account
/// in the pool and updates the usage cache `GET /admin/data` reads from.
async fn admin_refresh_usage_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let accounts = state.store.snapshot();
    let mut refreshed = 0usize;
    let mut failed = 0usize;

    for mut account in accounts {
        match state
            .adapter
            .fetch_usage_limits(&mut account, &state.store)
            .await
        {
            Ok(usage) => {
                state.usage_cache.insert(account.id.clone(), usage);
                refreshed += 1;
            }
            Err(e) => {
                tracing::warn!("Failed to refresh usage for account {}: {}", account.id, e.message);
                failed += 1;
            }
        }
    }

    Ok(Json(json!({
        "refreshed": refreshed,
        "failed": failed,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::FileAccountStore;
    use crate::auth::types::Credentials;
    use std::path::PathBuf;

    fn test_credentials() -> Credentials {
        Credentials {
            refresh_token: "refresh".to_string(),
            access_token: Some("token".to_string()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            profile_arn: None,
            region: "us-east-1".to_string(),
            client_id: None,
            client_secret: None,
            sso_region: None,
            scopes: None,
        }
    }

    fn create_test_state() -> AppState {
        let cache = ModelCache::new(3600);
        cache.update(vec![
            serde_json::json!({
                "modelId": "claude-sonnet-4.5",
                "modelName": "Claude Sonnet 4.5"
            }),
            serde_json::json!({
                "modelId": "claude-haiku-4",
                "modelName": "Claude Haiku 4"
            }),
        ]);

        let resolver = ModelResolver::new(cache.clone(), HashMap::new());

        let config = Arc::new(Config {
            server_host: "0.0.0.0".to_string(),
            server_port: 8000,
            proxy_api_key: "test-key".to_string(),
            kiro_region: "us-east-1".to_string(),
            kiro_cli_db_file: None,
            streaming_timeout: 300,
            token_refresh_threshold: 300,
            first_token_timeout: 15,
            http_max_connections: 20,
            http_connect_timeout: 30,
            http_request_timeout: 300,
            http_max_retries: 3,
            debug_mode: crate::config::DebugMode::Off,
            log_level: "info".to_string(),
            tool_description_max_length: 10000,
            fake_reasoning_enabled: false,
            fake_reasoning_max_tokens: 10000,
            fake_reasoning_handling: crate::config::FakeReasoningHandling::AsReasoningContent,
            kiro_accounts_dir: None,
            account_cooldown_ms: 60_000,
            quota_reset_utc: false,
            cron_near_minutes: 10,
            context_warning_tokens: 170_000,
            context_hard_warning_tokens: 190_000,
        });

        let metrics = Arc::new(crate::metrics::MetricsCollector::new());

        let file_store = Arc::new(FileAccountStore::new(PathBuf::from("/tmp/nonexistent")));
        file_store.insert(Account::new(
            "acc-1".to_string(),
            "a@example.com".to_string(),
            test_credentials(),
        ));
        let store: Arc<dyn AccountStore> = file_store;
        let dispatcher = Arc::new(AccountPoolDispatcher::new(store.clone(), 60_000, false));
        let adapter = Arc::new(KiroAdapter::new(30, 300, 3));

        AppState {
            proxy_api_key: Arc::new(RwLock::new("test-key".to_string())),
            admin_proxy_settings: Arc::new(RwLock::new(AdminProxySettings {
                enabled: true,
                port: 8000,
            })),
            model_cache: cache,
            resolver,
            config,
            metrics,
            store,
            adapter,
            dispatcher,
            usage_cache: Arc::new(dashmap::DashMap::new()),
        }
    }

    #[tokio::test]
    async fn test_root_handler() {
        let json = root_handler().await;
        let value = json.0;

        assert_eq!(value["status"], "ok");
        assert_eq!(value["message"], "Kiro Gateway is running");
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn test_health_handler() {
        let json = health_handler().await;
        let value = json.0;

        assert_eq!(value["status"], "healthy");
        assert!(value["timestamp"].is_string());
        assert_eq!(value["version"], VERSION);
    }

    #[tokio::test]
    async fn test_get_models_handler() {
        let state = create_test_state();

        let result = get_models_handler(State(state)).await;
        assert!(result.is_ok());

        let model_list = result.unwrap().0;
        assert_eq!(model_list.object, "list");
        assert_eq!(model_list.data.len(), 2);

        let model_ids: Vec<String> = model_list.data.iter().map(|m| m.id.clone()).collect();
        assert!(model_ids.contains(&"claude-sonnet-4.5".to_string()));
        assert!(model_ids.contains(&"claude-haiku-4".to_string()));

        for model in &model_list.data {
            assert_eq!(model.object, "model");
            assert_eq!(model.owned_by, "kiro");
            assert!(model.description.is_some());
        }
    }

    #[tokio::test]
    async fn test_anthropic_messages_handler_without_version_header() {
        let state = create_test_state();

        let request = crate::models::anthropic::AnthropicMessagesRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![crate::models::anthropic::AnthropicMessage {
                role: "user".to_string(),
                content: serde_json::json!("Hello"),
            }],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let headers = axum::http::HeaderMap::new();

        let result = anthropic_messages_handler(State(state), headers, Json(request)).await;

        match result {
            Err(ApiError::ValidationError(msg)) => {
                assert!(
                    !msg.contains("anthropic-version"),
                    "anthropic-version header should be optional, got error: {}",
                    msg
                );
            }
            _ => {}
        }
    }

    #[tokio::test]
    async fn test_anthropic_messages_handler_empty_messages() {
        let state = create_test_state();

        let request = crate::models::anthropic::AnthropicMessagesRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let mut headers = axum::http::HeaderMap::new();
        headers.insert("anthropic-version", "2023-06-01".parse().unwrap());

        let result = anthropic_messages_handler(State(state), headers, Json(request)).await;

        assert!(result.is_err());
        match result {
            Err(ApiError::ValidationError(msg)) => {
                assert!(msg.contains("messages"));
            }
            _ => panic!("Expected ValidationError for empty messages"),
        }
    }

    #[tokio::test]
    async fn test_count_tokens_basic() {
        let state = create_test_state();

        let request = crate::models::anthropic::AnthropicMessagesRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![crate::models::anthropic::AnthropicMessage {
                role: "user".to_string(),
                content: serde_json::json!("Hello, how are you?"),
            }],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: None,
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let result = count_tokens_handler(State(state), Json(request)).await;
        assert!(result.is_ok());

        let response = result.unwrap().0;
        let input_tokens = response["input_tokens"].as_i64().unwrap();

        assert!(input_tokens > 0);
        assert!(input_tokens < 100);
    }

    #[tokio::test]
    async fn test_count_tokens_with_tools() {
        let state = create_test_state();

        let request = crate::models::anthropic::AnthropicMessagesRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![crate::models::anthropic::AnthropicMessage {
                role: "user".to_string(),
                content: serde_json::json!("What's the weather?"),
            }],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: Some(vec![crate::models::anthropic::AnthropicTool {
                name: "get_weather".to_string(),
                description: Some("Get the current weather".to_string()),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "location": {"type": "string"}
                    }
                }),
            }]),
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let result = count_tokens_handler(State(state), Json(request)).await;
        assert!(result.is_ok());

        let response = result.unwrap().0;
        let input_tokens = response["input_tokens"].as_i64().unwrap();

        assert!(input_tokens > 346);
    }

    #[tokio::test]
    async fn test_count_tokens_non_claude_model() {
        let state = create_test_state();

        let request = crate::models::anthropic::AnthropicMessagesRequest {
            model: "gpt-4".to_string(),
            messages: vec![crate::models::anthropic::AnthropicMessage {
                role: "user".to_string(),
                content: serde_json::json!("Hello"),
            }],
            max_tokens: 100,
            system: None,
            stream: false,
            tools: Some(vec![crate::models::anthropic::AnthropicTool {
                name: "test_tool".to_string(),
                description: Some("Test tool".to_string()),
                input_schema: serde_json::json!({"type": "object"}),
            }]),
            tool_choice: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: None,
            metadata: None,
        };

        let result = count_tokens_handler(State(state), Json(request)).await;
        assert!(result.is_ok());

        let response = result.unwrap().0;
        let input_tokens = response["input_tokens"].as_i64().unwrap();

        assert!(input_tokens > 0);
        assert!(input_tokens < 100);
    }

    #[test]
    fn test_account_profile_arn_only_for_kiro_desktop() {
        let mut account = Account::new(
            "a1".to_string(),
            "a1@example.com".to_string(),
            test_credentials(),
        );
        account.auth_type = AuthType::KiroDesktop;
        account.credentials.profile_arn = Some("arn:aws:profile".to_string());
        assert_eq!(account_profile_arn(&account), "arn:aws:profile");

        account.auth_type = AuthType::AwsSsoOidc;
        assert_eq!(account_profile_arn(&account), "");
    }

    #[test]
    fn test_context_length_warning_thresholds() {
        let config = Config {
            server_host: "0.0.0.0".to_string(),
            server_port: 8000,
            proxy_api_key: "k".to_string(),
            kiro_region: "us-east-1".to_string(),
            kiro_cli_db_file: None,
            streaming_timeout: 300,
            token_refresh_threshold: 300,
            first_token_timeout: 15,
            http_max_connections: 20,
            http_connect_timeout: 30,
            http_request_timeout: 300,
            http_max_retries: 3,
            debug_mode: crate::config::DebugMode::Off,
            log_level: "info".to_string(),
            tool_description_max_length: 10000,
            fake_reasoning_enabled: false,
            fake_reasoning_max_tokens: 10000,
            fake_reasoning_handling: crate::config::FakeReasoningHandling::AsReasoningContent,
            kiro_accounts_dir: None,
            account_cooldown_ms: 60_000,
            quota_reset_utc: false,
            cron_near_minutes: 10,
            context_warning_tokens: 170_000,
            context_hard_warning_tokens: 190_000,
        };

        assert!(context_length_warning(1000, &config).is_none());
        assert!(context_length_warning(175_000, &config).is_some());
        assert!(context_length_warning(195_000, &config).is_some());
    }

    #[test]
    fn test_account_status_str() {
        assert_eq!(account_status_str(AccountStatus::Active), "active");
        assert_eq!(
            account_status_str(AccountStatus::QuotaExhausted),
            "quota_exhausted"
        );
        assert_eq!(account_status_str(AccountStatus::Error), "error");
        assert_eq!(account_status_str(AccountStatus::Disabled), "disabled");
    }
}
