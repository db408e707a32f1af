//! Command-line argument dispatch and server initialization.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::auth;
use anyhow::{Context, Result};
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;
    let secret_key = matches
        .get_one::<String>("secret-key")
        .cloned()
        .context("missing required argument: --secret-key")?;

    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn: SecretString::from(dsn),
        secret_key: SecretString::from(secret_key),
        frontend_base_url: auth_opts.frontend_base_url,
        totp_issuer: auth_opts.totp_issuer,
        max_login_attempts: auth_opts.max_login_attempts,
        lockout_minutes: auth_opts.lockout_minutes,
        login_decay_seconds: auth_opts.login_decay_seconds,
        session_ttl_hours: auth_opts.session_ttl_hours,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn dispatches_to_server_action() {
        temp_env::with_vars(
            [
                ("CUSTODIA_PORT", None::<&str>),
                ("CUSTODIA_MAX_LOGIN_ATTEMPTS", None),
            ],
            || {
                let matches = crate::cli::commands::new().get_matches_from(vec![
                    "custodia",
                    "--dsn",
                    "postgres://localhost/custodia",
                    "--secret-key",
                    "c2VjcmV0",
                ]);
                let action = handler(&matches);
                assert!(action.is_ok());
                if let Ok(Action::Server(args)) = action {
                    assert_eq!(args.port, 8080);
                    assert_eq!(args.dsn.expose_secret(), "postgres://localhost/custodia");
                    assert_eq!(args.max_login_attempts, 5);
                }
            },
        );
    }
}
