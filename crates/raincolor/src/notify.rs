//! Notification delivery: webhook and speech synthesis.
//!
//! Invoked only on a notify/clear transition. The two sinks are attempted
//! independently; either one failing is logged and never affects the other,
//! the device actuation, or the state machine.

use crate::config::{Location, SpeechTarget, WebhookTarget};
use crate::state::Transition;
use serde_json::json;

/// Local command used to play synthesized audio.
const PLAYER: &str = "aplay";

/// Errors from a single notification sink.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Webhook error: {0}")]
    Webhook(String),
    #[error("Synthesis error: {0}")]
    Synthesis(String),
    #[error("Playback error: {0}")]
    Playback(String),
}

/// One outbound notification, produced only on a transition and dropped
/// after delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub location: String,
    pub text: String,
    pub webhook: Option<WebhookTarget>,
    pub speech: Option<SpeechTarget>,
}

impl NotificationEvent {
    /// Compose the event for a transition: the location name plus its
    /// started/cleared template. `None` when there is no edge.
    pub fn for_transition(location: &Location, transition: Transition) -> Option<Self> {
        let template = match transition {
            Transition::Started => &location.format_falling,
            Transition::Cleared => &location.format_clear,
            Transition::None => return None,
        };
        Some(NotificationEvent {
            location: location.name.clone(),
            text: format!("{}{}", location.name, template),
            webhook: location.webhook.clone(),
            speech: location.speech.clone(),
        })
    }
}

/// Delivers transition events to the configured sinks.
pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(client: reqwest::Client) -> Self {
        Notifier { client }
    }

    /// Deliver to every configured sink. Failures are logged per sink and
    /// never returned.
    pub async fn notify(&self, location: &Location, transition: Transition) {
        let Some(event) = NotificationEvent::for_transition(location, transition) else {
            return;
        };
        log::info!("{}: {:?}: {}", event.location, transition, event.text);

        let (webhook, speech) = tokio::join!(
            self.post_webhook(event.webhook.as_ref(), &event.text),
            self.speak(event.speech.as_ref(), &event.text),
        );
        if let Err(e) = webhook {
            log::warn!("Notify {}: {}", event.location, e);
        }
        if let Err(e) = speech {
            log::warn!("Notify {}: {}", event.location, e);
        }
    }

    async fn post_webhook(
        &self,
        target: Option<&WebhookTarget>,
        text: &str,
    ) -> Result<(), NotifyError> {
        let Some(target) = target else {
            return Ok(());
        };
        let mut body = json!({ "text": text });
        if let Some(channel) = &target.channel {
            body["channel"] = json!(channel);
        }
        let resp = self
            .client
            .post(&target.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Webhook(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Webhook(format!("status {}", resp.status())));
        }
        Ok(())
    }

    async fn speak(&self, target: Option<&SpeechTarget>, text: &str) -> Result<(), NotifyError> {
        let Some(target) = target else {
            return Ok(());
        };
        let wav = self.synthesize(target, text).await?;
        play(&wav).await
    }

    /// Two-step synthesis: build the audio query, patch the speed scale,
    /// then request the waveform.
    async fn synthesize(&self, target: &SpeechTarget, text: &str) -> Result<Vec<u8>, NotifyError> {
        let base = format!("http://{}:{}", target.host, target.port);
        let speaker = target.voice.to_string();

        let resp = self
            .client
            .post(format!("{}/audio_query", base))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await
            .map_err(|e| NotifyError::Synthesis(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Synthesis(format!(
                "audio_query: status {}",
                resp.status()
            )));
        }
        let mut query: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| NotifyError::Synthesis(e.to_string()))?;
        query["speedScale"] = json!(target.speed);

        let resp = self
            .client
            .post(format!("{}/synthesis", base))
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .send()
            .await
            .map_err(|e| NotifyError::Synthesis(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Synthesis(format!(
                "synthesis: status {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| NotifyError::Synthesis(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Hand the waveform to the local player.
async fn play(wav: &[u8]) -> Result<(), NotifyError> {
    let path = std::env::temp_dir().join(format!("raincolor-{}.wav", uuid::Uuid::new_v4()));
    tokio::fs::write(&path, wav)
        .await
        .map_err(|e| NotifyError::Playback(e.to_string()))?;
    let status = tokio::process::Command::new(PLAYER)
        .arg(&path)
        .status()
        .await;
    let _ = tokio::fs::remove_file(&path).await;
    let status = status.map_err(|e| NotifyError::Playback(format!("{}: {}", PLAYER, e)))?;
    if !status.success() {
        return Err(NotifyError::Playback(format!(
            "{} exited with {}",
            PLAYER, status
        )));
    }
    Ok(())
}
