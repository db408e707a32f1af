use crate::api::{self, ServerSettings};
use crate::auth::AuthConfig;
use anyhow::Result;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: SecretString,
    pub secret_key: SecretString,
    pub frontend_base_url: String,
    pub totp_issuer: String,
    pub max_login_attempts: u32,
    pub lockout_minutes: i64,
    pub login_decay_seconds: i64,
    pub session_ttl_hours: Option<i64>,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the database is unreachable, the secret key is
/// invalid, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let auth = AuthConfig::default()
        .with_max_login_attempts(args.max_login_attempts)
        .with_lockout_minutes(args.lockout_minutes)
        .with_login_decay_seconds(args.login_decay_seconds)
        .with_session_ttl_hours(args.session_ttl_hours);

    api::serve(ServerSettings {
        port: args.port,
        dsn: args.dsn,
        secret_key: args.secret_key,
        frontend_base_url: args.frontend_base_url,
        totp_issuer: args.totp_issuer,
        auth,
    })
    .await
}
