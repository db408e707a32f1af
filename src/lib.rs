//! # Custodia (Authentication & Authorization Core)
//!
//! `custodia` is an authentication and authorization service. It handles
//! credential login with optional TOTP two-factor, social sign-in, email
//! verification and password reset tokens, and role/permission-based access
//! control with wildcard matching.
//!
//! ## Login Defenses
//!
//! Three independent gates guard credential checks: a per-address blocklist
//! (manual and automatic), a per-identifier throttle, and per-account lockout
//! after repeated failures. Unknown identifiers and wrong passwords produce
//! the same public error so accounts cannot be enumerated.
//!
//! ## Tokens
//!
//! Session tokens are opaque secrets, stored only as SHA-256 hashes, one per
//! device label. Email verification and password reset links use single-use
//! ephemeral tokens with short lifetimes; consuming one voids every other
//! outstanding token of the same kind for that account.
//!
//! ## Authorization
//!
//! Permissions are dot-namespaced slugs resolved through roles plus direct
//! grants. A grant of `*` matches everything and `users.*` matches the whole
//! `users` namespace; required permissions are always literal.

pub mod api;
pub mod auth;
pub mod cli;
pub mod clock;
pub mod crypter;
pub mod ephemeral;
pub mod error;
pub mod notify;
pub mod ratelimit;
pub mod rbac;
pub mod store;
pub mod tokens;
pub mod totp;

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
