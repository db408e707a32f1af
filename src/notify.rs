//! Outbound notification abstraction.
//!
//! Delivery (SMTP, provider API, queueing) is the collaborator's concern; the
//! engine only hands over a recipient, a template kind, and a payload. The
//! default sender for local dev is `LogNotifier`, which logs and returns `Ok`.

use anyhow::Result;
use serde_json::Value;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmailTemplate {
    VerifyEmail,
    ResetPassword,
}

impl EmailTemplate {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VerifyEmail => "verify_email",
            Self::ResetPassword => "reset_password",
        }
    }
}

/// Email delivery seam. Fire-and-forget from the engine's perspective.
pub trait Notifier: Send + Sync {
    /// Deliver a message or return an error; the engine logs failures but
    /// never fails the triggering operation because of them.
    fn send_email(&self, recipient: &str, template: EmailTemplate, payload: &Value) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_email(&self, recipient: &str, template: EmailTemplate, payload: &Value) -> Result<()> {
        info!(
            recipient = %recipient,
            template = template.as_str(),
            payload = %payload,
            "email send stub"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn template_names_are_stable() {
        assert_eq!(EmailTemplate::VerifyEmail.as_str(), "verify_email");
        assert_eq!(EmailTemplate::ResetPassword.as_str(), "reset_password");
    }

    #[test]
    fn log_notifier_accepts_payloads() {
        let notifier = LogNotifier;
        let payload = json!({ "verify_url": "https://custodia.dev/verify-email#token=t" });
        assert!(
            notifier
                .send_email("user@example.com", EmailTemplate::VerifyEmail, &payload)
                .is_ok()
        );
    }
}
