//! Administrative endpoints. Every route gates on a live permission check,
//! so a role change takes effect on the next request.

pub mod permissions;
pub mod roles;
pub mod security;
pub mod users;
