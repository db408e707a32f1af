//! HTTP surface: router, shared state, and server startup.

use anyhow::{Context, Result, anyhow};
use axum::{
    Extension,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{delete, get, post, put},
};
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, info, info_span};
use ulid::Ulid;
use url::Url;

use crate::auth::social::{HttpIdentityResolver, IdentityResolver, SocialAuthService};
use crate::auth::{AuthConfig, AuthService};
use crate::clock::{Clock, SystemClock};
use crate::crypter::{ChaChaSecretCrypter, SecretCrypter};
use crate::ephemeral::{EmailVerificationService, PasswordResetService};
use crate::notify::{LogNotifier, Notifier};
use crate::ratelimit::{IpBlocklist, RateLimiter};
use crate::rbac::RbacService;
use crate::store::{
    AccountStore, AuditStore, BlockedIpStore, CounterStore, EphemeralTokenStore, PgStore,
    RbacStore, TokenStore,
};
use crate::tokens::TokenIssuer;
use crate::totp::TwoFactorService;

pub mod envelope;
pub mod handlers;
mod openapi;
pub mod types;

pub use openapi::openapi;

use crate::APP_USER_AGENT;

/// Everything the handlers need, shared behind one `Extension`.
pub struct AppState {
    pub auth: AuthService,
    pub social: SocialAuthService,
    pub rbac: RbacService,
    pub two_factor: TwoFactorService,
    pub tokens: TokenIssuer,
    pub verification: EmailVerificationService,
    pub password_reset: PasswordResetService,
    pub limiter: RateLimiter,
    pub blocklist: IpBlocklist,
    pub audit: Arc<dyn AuditStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub config: AuthConfig,
}

/// Server configuration assembled by the CLI.
pub struct ServerSettings {
    pub port: u16,
    pub dsn: SecretString,
    pub secret_key: SecretString,
    pub frontend_base_url: String,
    pub totp_issuer: String,
    pub auth: AuthConfig,
}

/// Build the full route table. State is attached by the caller.
#[must_use]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/health", get(handlers::health::health))
        .route("/openapi.json", get(openapi::serve_openapi))
        .route("/v1/auth/register", post(handlers::auth::register))
        .route("/v1/auth/login", post(handlers::auth::login))
        .route("/v1/auth/2fa/verify", post(handlers::auth::verify_two_factor))
        .route("/v1/auth/logout", post(handlers::auth::logout))
        .route("/v1/auth/logout-all", post(handlers::auth::logout_all))
        .route("/v1/auth/me", get(handlers::auth::me))
        .route("/v1/auth/password", put(handlers::password::update))
        .route("/v1/auth/password/forgot", post(handlers::password::forgot))
        .route("/v1/auth/password/validate", post(handlers::password::validate))
        .route("/v1/auth/password/reset", post(handlers::password::reset))
        .route("/v1/auth/email/resend", post(handlers::verification::resend))
        .route("/v1/auth/email/verify", post(handlers::verification::verify))
        .route("/v1/auth/2fa/enable", post(handlers::two_factor::enable))
        .route("/v1/auth/2fa/confirm", post(handlers::two_factor::confirm))
        .route("/v1/auth/2fa/disable", post(handlers::two_factor::disable))
        .route(
            "/v1/auth/2fa/recovery-codes",
            post(handlers::two_factor::regenerate_recovery_codes),
        )
        .route("/v1/auth/social/login", post(handlers::social::login))
        .route("/v1/auth/social/link", delete(handlers::social::unlink))
        .route("/v1/permissions/mine", get(handlers::permissions::mine))
        .route("/v1/permissions/check", post(handlers::permissions::check))
        .route(
            "/v1/admin/roles",
            get(handlers::admin::roles::list).post(handlers::admin::roles::create),
        )
        .route(
            "/v1/admin/roles/:id",
            get(handlers::admin::roles::show)
                .put(handlers::admin::roles::update)
                .delete(handlers::admin::roles::remove),
        )
        .route(
            "/v1/admin/roles/:id/permissions",
            get(handlers::admin::roles::permissions).put(handlers::admin::roles::set_permissions),
        )
        .route(
            "/v1/admin/permissions",
            get(handlers::admin::permissions::list).post(handlers::admin::permissions::create),
        )
        .route(
            "/v1/admin/permissions/:id",
            put(handlers::admin::permissions::update).delete(handlers::admin::permissions::remove),
        )
        .route(
            "/v1/admin/users/:id/roles",
            get(handlers::admin::users::roles).put(handlers::admin::users::sync_roles),
        )
        .route(
            "/v1/admin/users/:id/permissions",
            get(handlers::admin::users::direct_permissions)
                .put(handlers::admin::users::sync_permissions),
        )
        .route("/v1/admin/users/:id/unlock", post(handlers::admin::users::unlock))
        .route("/v1/admin/security/block", post(handlers::admin::security::block_ip))
        .route("/v1/admin/security/unblock", post(handlers::admin::security::unblock_ip))
        .route(
            "/v1/admin/security/blocked/:ip",
            get(handlers::admin::security::blocked_ip),
        )
        .route("/v1/admin/security/events", get(handlers::admin::security::events))
}

/// Connect to the database and assemble the service graph.
///
/// # Errors
/// Returns an error if the pool cannot connect or the secret key is invalid.
pub async fn build_state(settings: &ServerSettings) -> Result<Arc<AppState>> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(settings.dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PgStore::new(pool));
    let accounts: Arc<dyn AccountStore> = store.clone();
    let rbac_store: Arc<dyn RbacStore> = store.clone();
    let token_store: Arc<dyn TokenStore> = store.clone();
    let ephemeral_store: Arc<dyn EphemeralTokenStore> = store.clone();
    let counter_store: Arc<dyn CounterStore> = store.clone();
    let blocked_store: Arc<dyn BlockedIpStore> = store.clone();
    let audit: Arc<dyn AuditStore> = store;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let crypter: Arc<dyn SecretCrypter> = Arc::new(ChaChaSecretCrypter::from_base64(
        settings.secret_key.expose_secret(),
    )?);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let resolver: Arc<dyn IdentityResolver> = Arc::new(HttpIdentityResolver::new(APP_USER_AGENT)?);

    let rbac = RbacService::new(rbac_store);
    let tokens = TokenIssuer::new(token_store, clock.clone());
    let two_factor = TwoFactorService::new(
        accounts.clone(),
        crypter.clone(),
        clock.clone(),
        settings.totp_issuer.clone(),
    );
    let limiter = RateLimiter::new(counter_store.clone());
    let blocklist = IpBlocklist::new(blocked_store, counter_store, audit.clone(), clock.clone());

    let verification = EmailVerificationService::new(
        ephemeral_store.clone(),
        accounts.clone(),
        notifier.clone(),
        audit.clone(),
        clock.clone(),
        settings.frontend_base_url.clone(),
    );
    let password_reset = PasswordResetService::new(
        ephemeral_store,
        accounts.clone(),
        tokens.clone(),
        notifier,
        audit.clone(),
        clock.clone(),
        settings.frontend_base_url.clone(),
    );
    let social = SocialAuthService::new(
        accounts.clone(),
        rbac.clone(),
        tokens.clone(),
        crypter,
        resolver,
        blocklist.clone(),
        audit.clone(),
        clock.clone(),
    );
    let auth = AuthService::new(
        accounts.clone(),
        rbac.clone(),
        tokens.clone(),
        two_factor.clone(),
        limiter.clone(),
        blocklist.clone(),
        audit.clone(),
        clock,
        settings.auth.clone(),
    );

    Ok(Arc::new(AppState {
        auth,
        social,
        rbac,
        two_factor,
        tokens,
        verification,
        password_reset,
        limiter,
        blocklist,
        audit,
        accounts,
        config: settings.auth.clone(),
    }))
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn serve(settings: ServerSettings) -> Result<()> {
    let state = build_state(&settings).await?;

    let frontend_origin = frontend_origin(&settings.frontend_base_url)?;
    let cors = CorsLayer::new()
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(AllowOrigin::exact(frontend_origin))
        .allow_credentials(true);

    let app = router()
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(state)),
        );

    let listener = TcpListener::bind(format!("::0:{}", settings.port)).await?;

    info!("Listening on [::]:{}", settings.port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Gracefully shutdown");
    })
    .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frontend_origin_strips_path_and_keeps_port() {
        let origin = frontend_origin("https://app.example.com:8443/dashboard").unwrap();
        assert_eq!(origin.to_str().unwrap(), "https://app.example.com:8443");

        let origin = frontend_origin("http://localhost:3000").unwrap();
        assert_eq!(origin.to_str().unwrap(), "http://localhost:3000");
    }

    #[test]
    fn frontend_origin_rejects_garbage() {
        assert!(frontend_origin("not a url").is_err());
    }
}
