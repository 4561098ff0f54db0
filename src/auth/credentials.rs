// Credential loading from SQLite database

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::Path;

use super::types::{AuthType, Credentials, SqliteDeviceRegistration, SqliteTokenData};

/// Load credentials from SQLite database (kiro-cli)
pub fn load_from_sqlite(path: &Path) -> Result<Credentials> {
    let conn = rusqlite::Connection::open(path)
        .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

    // Load token data (try both key formats)
    let token_json: String = conn
        .query_row(
            "SELECT value FROM auth_kv WHERE key = ?",
            ["kirocli:odic:token"],
            |row| row.get(0),
        )
        .or_else(|_| {
            conn.query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                ["codewhisperer:odic:token"],
                |row| row.get(0),
            )
        })
        .context("Failed to load token data from SQLite")?;

    let token_data: SqliteTokenData =
        serde_json::from_str(&token_json).context("Failed to parse token data from SQLite")?;

    // Load device registration (try both key formats)
    let registration_json: String = conn
        .query_row(
            "SELECT value FROM auth_kv WHERE key = ?",
            ["kirocli:odic:device-registration"],
            |row| row.get(0),
        )
        .or_else(|_| {
            conn.query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                ["codewhisperer:odic:device-registration"],
                |row| row.get(0),
            )
        })
        .context("Failed to load device registration from SQLite")?;

    let registration: SqliteDeviceRegistration = serde_json::from_str(&registration_json)
        .context("Failed to parse device registration from SQLite")?;

    let refresh_token = token_data
        .refresh_token
        .context("SQLite token data must contain refresh_token")?;

    let expires_at = token_data.expires_at.and_then(|s| parse_datetime(&s).ok());

    // SSO region is used for OIDC token refresh only
    // API region stays as us-east-1 (CodeWhisperer is only available there)
    let sso_region = token_data.region.or(registration.region);

    Ok(Credentials {
        refresh_token,
        access_token: token_data.access_token,
        expires_at,
        profile_arn: None,
        region: "us-east-1".to_string(), // CodeWhisperer API region
        client_id: registration.client_id,
        client_secret: registration.client_secret,
        sso_region,
        scopes: token_data.scopes,
    })
}

/// Detect authentication type based on credentials.
///
/// IdC (AWS SSO OIDC) accounts carry a client id/secret pair issued at
/// device-registration time; social (Kiro Desktop) accounts refresh with
/// just the refresh token against the desktop auth endpoint.
pub fn detect_auth_type(creds: &Credentials) -> AuthType {
    if creds.client_id.is_some() && creds.client_secret.is_some() {
        AuthType::AwsSsoOidc
    } else {
        AuthType::KiroDesktop
    }
}

/// Parse datetime from various ISO 8601 formats
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    // Handle Z suffix
    let normalized = if s.ends_with('Z') {
        s.replace('Z', "+00:00")
    } else {
        s.to_string()
    };

    DateTime::parse_from_rfc3339(&normalized)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse datetime: {}", s))
}
