use tracing::warn;

/// Fire-and-forget operator notifications. Disabled unless a webhook URL
/// is configured and `--notify` is set.
#[derive(Clone)]
pub struct WebhookMessager {
    url: Option<String>,
    chain_name: String,
    enabled: bool,
    client: reqwest::Client,
}

impl WebhookMessager {
    pub fn new(url: Option<String>, chain_name: &str, enabled: bool) -> Self {
        Self { url, chain_name: chain_name.to_string(), enabled, client: reqwest::Client::new() }
    }

    pub async fn notify(&self, message: &str) {
        let Some(url) = self.url.as_ref().filter(|_| self.enabled) else {
            return;
        };

        let body = serde_json::json!({
            "content": format!("[{}] {}", self.chain_name, message),
        });

        if let Err(err) = self.client.post(url).json(&body).send().await {
            warn!(error = %err, "error delivering webhook notification");
        }
    }

    pub async fn notify_error(&self, error: &eyre::Report) {
        self.notify(&format!("error: {error}")).await;
    }
}
