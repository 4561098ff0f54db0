// Authentication module
// Credential loading, auth-method detection, and per-account token refresh.
// There is no process-wide manager: each pooled `Account` owns its own
// `Credentials` and is refreshed independently by `adapter::KiroAdapter`.

pub mod credentials;
pub mod refresh;
pub mod types;

pub use credentials::detect_auth_type;
