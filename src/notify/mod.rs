mod mailer;
mod webhook;

use std::fmt;

use log::{info, warn};
use serde_json::json;

use crate::config::NotifyConfig;
use crate::error::HostWatchError;

pub use mailer::SendmailMailer;
pub use webhook::HttpWebhook;

/// Outbound email through a local mail-sending facility
pub trait MailSender {
    /// False when the facility isn't installed on this host
    fn is_available(&self) -> bool;

    fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), HostWatchError>;
}

/// Outbound HTTP POST of a JSON body
pub trait WebhookSender {
    fn post(&self, url: &str, payload: &serde_json::Value) -> Result<(), HostWatchError>;
}

/// Outcome of one best-effort delivery attempt. Never escalated into a
/// pipeline failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EmailSkipped,
    WebhookSkipped,
}

impl SkipReason {
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::EmailSkipped => "EMAIL_SKIPPED",
            SkipReason::WebhookSkipped => "WEBHOOK_SKIPPED",
        }
    }
}

impl fmt::Display for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Delivery::Sent => write!(f, "sent"),
            Delivery::Skipped(reason) => write!(f, "skipped ({})", reason.code()),
            Delivery::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Fans notifications out to the email and chat webhook channels.
///
/// The channels are independent: a skip or failure on one never affects
/// the other, and neither retries.
pub struct Notifier {
    mailer: Box<dyn MailSender>,
    webhook: Box<dyn WebhookSender>,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(
        mailer: Box<dyn MailSender>,
        webhook: Box<dyn WebhookSender>,
        webhook_url: Option<String>,
    ) -> Self {
        Notifier {
            mailer,
            webhook,
            webhook_url,
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Result<Self, HostWatchError> {
        Ok(Notifier::new(
            Box::new(SendmailMailer::new(&config.sendmail, &config.mail_from)),
            Box::new(HttpWebhook::new(config.webhook_timeout_secs)?),
            config.webhook_url.clone(),
        ))
    }

    pub fn email(&self, to: Option<&str>, subject: &str, body: &str) -> Delivery {
        let Some(to) = to else {
            warn!("{}: no recipient address configured", SkipReason::EmailSkipped.code());
            return Delivery::Skipped(SkipReason::EmailSkipped);
        };

        if !self.mailer.is_available() {
            warn!("{}: no local mail facility available", SkipReason::EmailSkipped.code());
            return Delivery::Skipped(SkipReason::EmailSkipped);
        }

        match self.mailer.send(to, subject, body) {
            Ok(()) => {
                info!("Sent email '{}' to {}", subject, to);
                Delivery::Sent
            }
            Err(e) => {
                warn!("Email to {} failed: {}", to, e);
                Delivery::Failed(e.to_string())
            }
        }
    }

    /// Posts `{"text": "<message>\n<excerpt>"}` to the chat webhook. JSON
    /// serialization escapes the excerpt for transport.
    pub fn chat(&self, message: &str, excerpt: &str) -> Delivery {
        let Some(url) = self.webhook_url.as_deref() else {
            warn!("{}: no webhook URL configured", SkipReason::WebhookSkipped.code());
            return Delivery::Skipped(SkipReason::WebhookSkipped);
        };

        let payload = json!({ "text": format!("{}\n{}", message, excerpt) });

        match self.webhook.post(url, &payload) {
            Ok(()) => {
                info!("Posted webhook notification");
                Delivery::Sent
            }
            Err(e) => {
                warn!("Webhook post failed: {}", e);
                Delivery::Failed(e.to_string())
            }
        }
    }
}
