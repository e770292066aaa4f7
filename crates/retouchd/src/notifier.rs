use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::json;

/// Messaging collaborator: delivers text and result images to the end user
/// over the Telegram Bot HTTP API. Fire-and-forget from the ledger's point of
/// view; callers log failures and move on, the ledger write has already
/// committed by the time any send happens.
#[derive(Clone)]
pub(crate) struct Notifier {
    client: Client,
    bot_token: String,
}

impl Notifier {
    pub(crate) fn new(bot_token: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
        }
    }

    pub(crate) async fn send_text(&self, user_id: i64, text: &str) -> Result<(), String> {
        let token = self.bot_token.trim();
        if token.is_empty() {
            return Err("telegram bot token is empty".to_string());
        }
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": user_id,
                "text": text
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("status={status} body={body}"));
        }
        Ok(())
    }

    pub(crate) async fn send_photo(
        &self,
        user_id: i64,
        image: Vec<u8>,
        caption: &str,
    ) -> Result<(), String> {
        let token = self.bot_token.trim();
        if token.is_empty() {
            return Err("telegram bot token is empty".to_string());
        }
        let url = format!("https://api.telegram.org/bot{token}/sendPhoto");
        let form = Form::new()
            .text("chat_id", user_id.to_string())
            .text("caption", caption.to_string())
            .part("photo", Part::bytes(image).file_name("result.jpg"));
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("status={status} body={body}"));
        }
        Ok(())
    }
}
