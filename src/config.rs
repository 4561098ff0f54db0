// Configuration module
// Loads and validates configuration from CLI args, environment variables, and defaults

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Kiro Gateway - Rust Implementation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "SERVER_HOST")]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Authentication
    pub proxy_api_key: String,

    // Kiro credentials
    pub kiro_region: String,
    // Single-account import (legacy); superseded by `kiro_accounts_dir` when set.
    pub kiro_cli_db_file: Option<PathBuf>,

    // Timeouts
    #[allow(dead_code)]
    pub streaming_timeout: u64,
    pub token_refresh_threshold: u64,
    pub first_token_timeout: u64,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Debug
    pub debug_mode: DebugMode,
    pub log_level: String,

    // Converter settings
    pub tool_description_max_length: usize,
    pub fake_reasoning_enabled: bool,
    pub fake_reasoning_max_tokens: u32,
    #[allow(dead_code)]
    pub fake_reasoning_handling: FakeReasoningHandling,

    // Account pool
    pub kiro_accounts_dir: Option<PathBuf>,
    pub account_cooldown_ms: i64,
    pub quota_reset_utc: bool,
    pub cron_near_minutes: i64,

    // Context-length warnings
    pub context_warning_tokens: u32,
    pub context_hard_warning_tokens: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FakeReasoningHandling {
    AsReasoningContent,  // Extract to reasoning_content field (OpenAI-compatible)
    Remove,              // Remove thinking block completely
    Pass,                // Pass through with original tags
    StripTags,           // Remove tags but keep content
}

#[derive(Clone, Debug, PartialEq)]
pub enum DebugMode {
    Off,
    Errors,
    All,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        // Parse CLI arguments
        let args = CliArgs::parse();

        // Build config with priority handling
        let config = Config {
            // Server settings (CLI > ENV > default)
            server_host: args
                .host
                .or_else(|| std::env::var("SERVER_HOST").ok())
                .unwrap_or_else(|| "0.0.0.0".to_string()),

            server_port: args
                .port
                .or_else(|| std::env::var("SERVER_PORT").ok().and_then(|s| s.parse().ok()))
                .unwrap_or(8000),

            // Authentication (required)
            proxy_api_key: std::env::var("PROXY_API_KEY")
                .context("PROXY_API_KEY environment variable is required")?,

            // Kiro credentials
            kiro_region: std::env::var("KIRO_REGION").unwrap_or_else(|_| "us-east-1".to_string()),

            kiro_cli_db_file: std::env::var("KIRO_CLI_DB_FILE")
                .ok()
                .map(|s| expand_tilde(&s)),

            // Timeouts
            streaming_timeout: std::env::var("STREAMING_READ_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            token_refresh_threshold: std::env::var("TOKEN_REFRESH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            first_token_timeout: std::env::var("FIRST_TOKEN_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(15),

            // HTTP client
            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),

            http_request_timeout: std::env::var("HTTP_REQUEST_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),

            http_max_retries: std::env::var("HTTP_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),

            // Debug
            debug_mode: parse_debug_mode(&std::env::var("DEBUG_MODE").unwrap_or_default()),

            log_level: args
                .log_level
                .or_else(|| std::env::var("LOG_LEVEL").ok())
                .unwrap_or_else(|| "info".to_string()),

            // Converter settings
            tool_description_max_length: std::env::var("TOOL_DESCRIPTION_MAX_LENGTH")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10000),

            // Fake reasoning - enabled by default (like Python)
            // FAKE_REASONING env var: empty/"true"/"1"/"yes" = enabled, "false"/"0"/"no"/"disabled"/"off" = disabled
            fake_reasoning_enabled: {
                let raw = std::env::var("FAKE_REASONING").unwrap_or_default().to_lowercase();
                // Default is true - only disable if explicitly set to false/0/no/disabled/off
                !matches!(raw.as_str(), "false" | "0" | "no" | "disabled" | "off")
            },

            fake_reasoning_max_tokens: std::env::var("FAKE_REASONING_MAX_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4000),

            fake_reasoning_handling: parse_fake_reasoning_handling(
                &std::env::var("FAKE_REASONING_HANDLING").unwrap_or_default()
            ),

            kiro_accounts_dir: std::env::var("KIRO_ACCOUNTS_DIR")
                .ok()
                .map(|s| expand_tilde(&s)),

            account_cooldown_ms: std::env::var("ACCOUNT_COOLDOWN_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60_000),

            // Kiro's billing-month boundary isn't documented; default to the
            // local timezone and let operators pin it to UTC if that proves wrong.
            quota_reset_utc: matches!(
                std::env::var("QUOTA_RESET_TZ").unwrap_or_default().to_lowercase().as_str(),
                "utc"
            ),

            cron_near_minutes: std::env::var("CRON_NEAR_MINUTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            context_warning_tokens: std::env::var("CONTEXT_WARNING_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(170_000),

            context_hard_warning_tokens: std::env::var("CONTEXT_HARD_WARNING_TOKENS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(190_000),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match (&self.kiro_cli_db_file, &self.kiro_accounts_dir) {
            (None, None) => anyhow::bail!(
                "Either KIRO_CLI_DB_FILE or KIRO_ACCOUNTS_DIR must be set"
            ),
            (Some(db_file), _) if !db_file.exists() => {
                anyhow::bail!("KIRO_CLI_DB_FILE does not exist: {}", db_file.display())
            }
            _ => {}
        }

        Ok(())
    }
}

/// Values gathered from the first-run interactive prompt, written to `.env`
/// so subsequent starts skip straight to `Config::load`.
pub struct InteractiveConfig {
    pub proxy_api_key: String,
    pub kiro_cli_db_file: String,
    pub kiro_region: String,
    pub server_port: String,
}

/// True when no `.env` file is present and the required settings aren't
/// already in the environment (e.g. injected by a container orchestrator).
pub fn needs_interactive_setup() -> bool {
    if PathBuf::from(".env").exists() {
        return false;
    }
    std::env::var("PROXY_API_KEY").is_err()
        && std::env::var("KIRO_CLI_DB_FILE").is_err()
        && std::env::var("KIRO_ACCOUNTS_DIR").is_err()
}

/// Prompts for the minimum settings needed to boot and persists them to
/// `.env` in the current directory.
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    use dialoguer::{Input, Password};

    println!("Kiro Gateway setup — no .env file found, let's create one.\n");

    let proxy_api_key: String = Password::new()
        .with_prompt("Proxy API key (clients must send this as Authorization: Bearer <key>)")
        .interact()
        .context("Failed to read proxy API key")?;

    let kiro_cli_db_file: String = Input::new()
        .with_prompt("Path to kiro-cli SQLite auth database")
        .default("~/.aws/sso/cache/kiro-auth.db".to_string())
        .interact_text()
        .context("Failed to read database path")?;

    let kiro_region: String = Input::new()
        .with_prompt("Kiro region")
        .default("us-east-1".to_string())
        .interact_text()
        .context("Failed to read region")?;

    let server_port: String = Input::new()
        .with_prompt("Server port")
        .default("8000".to_string())
        .interact_text()
        .context("Failed to read port")?;

    let config = InteractiveConfig {
        proxy_api_key,
        kiro_cli_db_file,
        kiro_region,
        server_port,
    };

    write_env_file(&config)?;

    Ok(config)
}

fn write_env_file(config: &InteractiveConfig) -> Result<()> {
    let contents = format!(
        "PROXY_API_KEY={}\nKIRO_CLI_DB_FILE={}\nKIRO_REGION={}\nSERVER_PORT={}\n",
        config.proxy_api_key, config.kiro_cli_db_file, config.kiro_region, config.server_port
    );
    std::fs::write(".env", contents).context("Failed to write .env file")?;
    println!("\nSaved configuration to .env\n");
    Ok(())
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&path[2..]);
        }
    }
    PathBuf::from(path)
}

/// Parse debug mode from string
fn parse_debug_mode(s: &str) -> DebugMode {
    match s.to_lowercase().as_str() {
        "errors" => DebugMode::Errors,
        "all" => DebugMode::All,
        _ => DebugMode::Off,
    }
}

/// Parse fake reasoning handling mode from string
fn parse_fake_reasoning_handling(s: &str) -> FakeReasoningHandling {
    match s.to_lowercase().as_str() {
        "remove" => FakeReasoningHandling::Remove,
        "pass" => FakeReasoningHandling::Pass,
        "strip_tags" => FakeReasoningHandling::StripTags,
        _ => FakeReasoningHandling::AsReasoningContent, // default
    }
}
