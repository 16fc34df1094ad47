//! Cloud device API client.
//!
//! Every request is signed per the vendor's v1.1 scheme: headers carry the
//! raw token, a millisecond timestamp `t`, a random UUID `nonce` and
//! `sign = base64(HMAC-SHA256(secret, token || t || nonce))`. Credentials
//! load from the per-user file `~/.switchbot`; a missing or malformed file
//! disables the cloud protocol only, never the process.

use super::{ActuationError, DeviceCommand, Power};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::path::Path;

const BASE_URL: &str = "https://api.switch-bot.com";
const CREDENTIAL_FILE: &str = ".switchbot";

/// Credential loading errors; fatal to the cloud protocol only.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Credential file not found: {0}")]
    Missing(String),
    #[error("Credential file unreadable: {0}")]
    Io(String),
    #[error("Credential file malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct Credentials {
    token: String,
    secret: String,
}

/// Signed HTTP client for the cloud device API.
pub struct SwitchBotClient {
    token: String,
    secret: String,
    client: reqwest::Client,
}

impl SwitchBotClient {
    /// Load credentials from `~/.switchbot`.
    pub fn from_credential_file(client: reqwest::Client) -> Result<Self, CredentialError> {
        let path = dirs::home_dir()
            .ok_or_else(|| CredentialError::Missing("no home directory".to_string()))?
            .join(CREDENTIAL_FILE);
        Self::from_file(client, &path)
    }

    pub fn from_file(client: reqwest::Client, path: &Path) -> Result<Self, CredentialError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CredentialError::Missing(path.display().to_string())
            } else {
                CredentialError::Io(format!("{}: {}", path.display(), e))
            }
        })?;
        let credentials: Credentials = serde_json::from_str(&contents)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if credentials.token.is_empty() || credentials.secret.is_empty() {
            return Err(CredentialError::Malformed(
                "empty token or secret".to_string(),
            ));
        }
        Ok(SwitchBotClient {
            token: credentials.token,
            secret: credentials.secret,
            client,
        })
    }

    fn signed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let t = chrono::Utc::now().timestamp_millis();
        let nonce = uuid::Uuid::new_v4().to_string();
        let sign = sign_request(&self.secret, &self.token, t, &nonce);
        request
            .header("Authorization", &self.token)
            .header("sign", sign)
            .header("t", t.to_string())
            .header("nonce", nonce)
            .header("Content-Type", "application/json; charset=utf-8")
    }

    /// List the account's devices; returns the response body verbatim.
    pub async fn device_list(&self) -> Result<serde_json::Value, ActuationError> {
        self.get_json(&format!("{}/v1.1/devices", BASE_URL)).await
    }

    /// Fetch one device's status body.
    pub async fn device_status(&self, device_id: &str) -> Result<serde_json::Value, ActuationError> {
        let value = self
            .get_json(&format!("{}/v1.1/devices/{}/status", BASE_URL, device_id))
            .await?;
        Ok(value.get("body").cloned().unwrap_or_default())
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, ActuationError> {
        let resp = self
            .signed(self.client.get(url))
            .send()
            .await
            .map_err(|e| ActuationError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ActuationError::Api(format!("{}: status {}", url, resp.status())));
        }
        resp.json()
            .await
            .map_err(|e| ActuationError::Api(e.to_string()))
    }

    /// Post one `{command, parameter, commandType}` body to a device.
    pub async fn post_command(
        &self,
        device_id: &str,
        command: &str,
        parameter: &str,
    ) -> Result<(), ActuationError> {
        let url = format!("{}/v1.1/devices/{}/commands", BASE_URL, device_id);
        let resp = self
            .signed(self.client.post(&url))
            .json(&command_body(command, parameter))
            .send()
            .await
            .map_err(|e| ActuationError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ActuationError::Api(format!(
                "{} {}: status {}",
                command,
                device_id,
                resp.status()
            )));
        }
        Ok(())
    }

    /// Apply an intent as the protocol's command sequence: brightness, then
    /// color, then power for "on"; a single power-off otherwise.
    pub async fn apply(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), ActuationError> {
        match command.power {
            Power::Off => self.post_command(device_id, "turnOff", "default").await,
            Power::On => {
                if let Some(brightness) = command.brightness {
                    self.post_command(device_id, "setBrightness", &brightness.to_string())
                        .await?;
                }
                if let Some(color) = command.color {
                    let parameter = format!("{}:{}:{}", color.r, color.g, color.b);
                    self.post_command(device_id, "setColor", &parameter).await?;
                }
                self.post_command(device_id, "turnOn", "default").await
            }
        }
    }
}

fn command_body(command: &str, parameter: &str) -> serde_json::Value {
    json!({
        "command": command,
        "parameter": parameter,
        "commandType": "command",
    })
}

/// `base64(HMAC-SHA256(secret, token || t || nonce))`.
pub fn sign_request(secret: &str, token: &str, t: i64, nonce: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("{}{}{}", token, t, nonce).as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Human-readable one-liner for known device types, from a status body.
pub fn summarize_status(body: &serde_json::Value) -> Option<String> {
    match body.get("deviceType")?.as_str()? {
        // Temperature and humidity sensors
        "Meter" | "MeterPlus" | "WoIOSensor" => {
            let temperature = body.get("temperature")?;
            let humidity = body.get("humidity")?;
            Some(format!("{}C {}%", temperature, humidity))
        }
        // Anything with a plain power state
        "Color Bulb" | "Bot" | "Plug" | "Plug Mini (US)" | "Plug Mini (JP)" => {
            Some(body.get("power")?.as_str()?.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_and_base64() {
        let a = sign_request("secret", "token", 1_700_000_000_000, "nonce-1");
        let b = sign_request("secret", "token", 1_700_000_000_000, "nonce-1");
        assert_eq!(a, b);
        // SHA-256 MAC is 32 bytes, 44 characters of standard base64.
        assert_eq!(a.len(), 44);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn sign_varies_with_every_input() {
        let base = sign_request("secret", "token", 1, "n");
        assert_ne!(sign_request("secret2", "token", 1, "n"), base);
        assert_ne!(sign_request("secret", "token2", 1, "n"), base);
        assert_ne!(sign_request("secret", "token", 2, "n"), base);
        assert_ne!(sign_request("secret", "token", 1, "m"), base);
    }

    #[test]
    fn command_body_shape() {
        let body = command_body("setColor", "10:20:30");
        assert_eq!(
            body,
            serde_json::json!({
                "command": "setColor",
                "parameter": "10:20:30",
                "commandType": "command",
            })
        );
    }

    #[test]
    fn credentials_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".switchbot");
        std::fs::write(&path, r#"{"token": "tok", "secret": "sec"}"#).unwrap();
        let client = SwitchBotClient::from_file(reqwest::Client::new(), &path).unwrap();
        assert_eq!(client.token, "tok");
        assert_eq!(client.secret, "sec");
    }

    #[test]
    fn missing_credential_file() {
        let dir = tempfile::tempdir().unwrap();
        let result =
            SwitchBotClient::from_file(reqwest::Client::new(), &dir.path().join(".switchbot"));
        assert!(matches!(result, Err(CredentialError::Missing(_))));
    }

    #[test]
    fn malformed_credential_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".switchbot");
        std::fs::write(&path, "not json").unwrap();
        let result = SwitchBotClient::from_file(reqwest::Client::new(), &path);
        assert!(matches!(result, Err(CredentialError::Malformed(_))));

        std::fs::write(&path, r#"{"token": "", "secret": ""}"#).unwrap();
        let result = SwitchBotClient::from_file(reqwest::Client::new(), &path);
        assert!(matches!(result, Err(CredentialError::Malformed(_))));
    }

    #[test]
    fn status_summaries() {
        let meter = serde_json::json!({
            "deviceType": "Meter", "temperature": 21.5, "humidity": 40
        });
        assert_eq!(summarize_status(&meter).as_deref(), Some("21.5C 40%"));

        let bulb = serde_json::json!({"deviceType": "Color Bulb", "power": "on"});
        assert_eq!(summarize_status(&bulb).as_deref(), Some("on"));

        let unknown = serde_json::json!({"deviceType": "Curtain"});
        assert_eq!(summarize_status(&unknown), None);
        assert_eq!(summarize_status(&serde_json::json!({})), None);
    }
}
