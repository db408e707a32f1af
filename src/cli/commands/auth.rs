use anyhow::{Context, Result};
use clap::{Arg, Command};

pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_TOTP_ISSUER: &str = "totp-issuer";
pub const ARG_MAX_LOGIN_ATTEMPTS: &str = "max-login-attempts";
pub const ARG_LOCKOUT_MINUTES: &str = "lockout-minutes";
pub const ARG_LOGIN_DECAY_SECONDS: &str = "login-decay-seconds";
pub const ARG_SESSION_TTL_HOURS: &str = "session-ttl-hours";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Base URL for links in verification and reset emails, and the CORS origin")
                .default_value("http://localhost:3000")
                .env("CUSTODIA_FRONTEND_BASE_URL"),
        )
        .arg(
            Arg::new(ARG_TOTP_ISSUER)
                .long(ARG_TOTP_ISSUER)
                .help("Issuer shown in authenticator apps")
                .default_value("Custodia")
                .env("CUSTODIA_TOTP_ISSUER"),
        )
        .arg(
            Arg::new(ARG_MAX_LOGIN_ATTEMPTS)
                .long(ARG_MAX_LOGIN_ATTEMPTS)
                .help("Failed attempts before the account locks and the throttle trips")
                .default_value("5")
                .env("CUSTODIA_MAX_LOGIN_ATTEMPTS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_MINUTES)
                .long(ARG_LOCKOUT_MINUTES)
                .help("How long a locked account stays locked")
                .default_value("30")
                .env("CUSTODIA_LOCKOUT_MINUTES")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_LOGIN_DECAY_SECONDS)
                .long(ARG_LOGIN_DECAY_SECONDS)
                .help("Throttle window for login attempts")
                .default_value("900")
                .env("CUSTODIA_LOGIN_DECAY_SECONDS")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_HOURS)
                .long(ARG_SESSION_TTL_HOURS)
                .help("Session token lifetime; omit for non-expiring sessions")
                .env("CUSTODIA_SESSION_TTL_HOURS")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
}

#[derive(Debug, Clone)]
pub struct Options {
    pub frontend_base_url: String,
    pub totp_issuer: String,
    pub max_login_attempts: u32,
    pub lockout_minutes: i64,
    pub login_decay_seconds: i64,
    pub session_ttl_hours: Option<i64>,
}

impl Options {
    /// # Errors
    /// Returns an error if a defaulted argument is somehow absent.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        Ok(Self {
            frontend_base_url: matches
                .get_one::<String>(ARG_FRONTEND_BASE_URL)
                .cloned()
                .context("missing frontend base URL")?,
            totp_issuer: matches
                .get_one::<String>(ARG_TOTP_ISSUER)
                .cloned()
                .context("missing TOTP issuer")?,
            max_login_attempts: matches
                .get_one::<u32>(ARG_MAX_LOGIN_ATTEMPTS)
                .copied()
                .context("missing max login attempts")?,
            lockout_minutes: matches
                .get_one::<i64>(ARG_LOCKOUT_MINUTES)
                .copied()
                .context("missing lockout minutes")?,
            login_decay_seconds: matches
                .get_one::<i64>(ARG_LOGIN_DECAY_SECONDS)
                .copied()
                .context("missing login decay seconds")?,
            session_ttl_hours: matches.get_one::<i64>(ARG_SESSION_TTL_HOURS).copied(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn matches_for(args: &[&str]) -> clap::ArgMatches {
        let mut argv = vec!["custodia", "--dsn", "postgres://", "--secret-key", "a"];
        argv.extend_from_slice(args);
        crate::cli::commands::new().get_matches_from(argv)
    }

    #[test]
    fn defaults_match_shipped_policy() {
        temp_env::with_vars(
            [
                ("CUSTODIA_MAX_LOGIN_ATTEMPTS", None::<&str>),
                ("CUSTODIA_LOCKOUT_MINUTES", None),
                ("CUSTODIA_SESSION_TTL_HOURS", None),
            ],
            || {
                let options = Options::parse(&matches_for(&[])).unwrap();
                assert_eq!(options.max_login_attempts, 5);
                assert_eq!(options.lockout_minutes, 30);
                assert_eq!(options.login_decay_seconds, 900);
                assert_eq!(options.session_ttl_hours, None);
                assert_eq!(options.totp_issuer, "Custodia");
            },
        );
    }

    #[test]
    fn overrides_apply() {
        let options = Options::parse(&matches_for(&[
            "--max-login-attempts",
            "3",
            "--lockout-minutes",
            "10",
            "--session-ttl-hours",
            "24",
        ]))
        .unwrap();
        assert_eq!(options.max_login_attempts, 3);
        assert_eq!(options.lockout_minutes, 10);
        assert_eq!(options.session_ttl_hours, Some(24));
    }
}
