use std::time::Duration;

use reqwest::blocking::Client;

use crate::error::HostWatchError;

use super::WebhookSender;

/// Posts JSON to a chat webhook over HTTP(S)
pub struct HttpWebhook {
    client: Client,
}

impl HttpWebhook {
    pub fn new(timeout_secs: u64) -> Result<Self, HostWatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(HttpWebhook { client })
    }
}

impl WebhookSender for HttpWebhook {
    /// Errors never carry the URL: webhook URLs embed their access token
    fn post(&self, url: &str, payload: &serde_json::Value) -> Result<(), HostWatchError> {
        self.client
            .post(url)
            .json(payload)
            .send()
            .map_err(|e| e.without_url())?
            .error_for_status()
            .map_err(|e| e.without_url())?;
        Ok(())
    }
}
