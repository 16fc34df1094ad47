//! Local bulb protocol.
//!
//! Bulbs accept line-delimited JSON commands on TCP port 55443 and answer
//! SSDP-style discovery probes on UDP port 1982. Commands are synchronous
//! and never retried; a dead bulb surfaces as a per-device warning.

use super::{ActuationError, DeviceCommand, Power};
use crate::color::Rgb;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

pub const COMMAND_PORT: u16 = 55443;

const DISCOVERY_ADDR: &str = "239.255.255.250:1982";
const DISCOVERY_PORT: u16 = 1982;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Smooth transition duration for power/color changes, in milliseconds.
const EFFECT_MS: u32 = 300;

/// One local-protocol bulb.
#[derive(Debug, Clone)]
pub struct YeelightBulb {
    addr: String,
}

impl YeelightBulb {
    /// `addr` may be `ip` or `ip:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let addr = if addr.contains(':') {
            addr
        } else {
            format!("{}:{}", addr, COMMAND_PORT)
        };
        YeelightBulb { addr }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn send(
        &self,
        id: u32,
        method: &str,
        params: serde_json::Value,
    ) -> Result<(), ActuationError> {
        let mut stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ActuationError::Timeout)?
            .map_err(|e| ActuationError::Connect(format!("{}: {}", self.addr, e)))?;

        let line = format!("{}\r\n", json!({"id": id, "method": method, "params": params}));
        tokio::time::timeout(IO_TIMEOUT, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| ActuationError::Timeout)?
            .map_err(|e| ActuationError::Io(e.to_string()))?;

        // Read and discard the result line; commands are fire-and-forget.
        let mut buf = [0u8; 256];
        let _ = tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf)).await;
        Ok(())
    }

    /// Apply an intent as the protocol's command sequence.
    pub async fn apply(&self, command: &DeviceCommand) -> Result<(), ActuationError> {
        match command.power {
            Power::Off => {
                self.send(1, "set_power", json!(["off", "smooth", EFFECT_MS]))
                    .await
            }
            Power::On => {
                self.send(1, "set_power", json!(["on", "smooth", EFFECT_MS]))
                    .await?;
                if let Some(color) = command.color {
                    self.send(2, "set_rgb", json!([rgb_value(color), "smooth", EFFECT_MS]))
                        .await?;
                }
                if let Some(brightness) = command.brightness {
                    self.send(3, "set_bright", json!([brightness, "smooth", EFFECT_MS]))
                        .await?;
                }
                Ok(())
            }
        }
    }
}

/// Pack channels into the protocol's single color integer.
fn rgb_value(color: Rgb) -> u32 {
    (color.r as u32) << 16 | (color.g as u32) << 8 | color.b as u32
}

/// Probe for bulbs via the discovery multicast group and the given broadcast
/// address, collecting replies until the deadline.
pub async fn discover(broadcast_addr: &str, wait: Duration) -> Result<Vec<String>, ActuationError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ActuationError::Io(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| ActuationError::Io(e.to_string()))?;

    let probe = format!(
        "M-SEARCH * HTTP/1.1\r\nHOST: {}\r\nMAN: \"ssdp:discover\"\r\nST: wifi_bulb\r\n",
        DISCOVERY_ADDR
    );
    for target in [
        DISCOVERY_ADDR.to_string(),
        format!("{}:{}", broadcast_addr, DISCOVERY_PORT),
    ] {
        if let Err(e) = socket.send_to(probe.as_bytes(), &target).await {
            log::debug!("Discovery probe to {} failed: {}", target, e);
        }
    }

    let deadline = tokio::time::Instant::now() + wait;
    let mut found = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break, // deadline reached
            Ok(Err(e)) => return Err(ActuationError::Io(e.to_string())),
            Ok(Ok((len, _peer))) => {
                let reply = String::from_utf8_lossy(&buf[..len]);
                if let Some(addr) = parse_discovery_location(&reply) {
                    if !found.contains(&addr) {
                        found.push(addr);
                    }
                }
            }
        }
    }
    Ok(found)
}

/// Extract `ip:port` from a discovery reply's `Location: yeelight://...`
/// header.
fn parse_discovery_location(reply: &str) -> Option<String> {
    reply.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("location") {
            return None;
        }
        value
            .trim()
            .strip_prefix("yeelight://")
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address_gets_default_port() {
        assert_eq!(YeelightBulb::new("192.168.1.21").addr(), "192.168.1.21:55443");
        assert_eq!(
            YeelightBulb::new("192.168.1.21:12345").addr(),
            "192.168.1.21:12345"
        );
    }

    #[test]
    fn rgb_value_packs_channels() {
        assert_eq!(rgb_value(Rgb::new(0xff, 0x00, 0x00)), 0xff0000);
        assert_eq!(rgb_value(Rgb::new(0x12, 0x34, 0x56)), 0x123456);
        assert_eq!(rgb_value(Rgb::BLACK), 0);
    }

    #[test]
    fn discovery_reply_parsed() {
        let reply = "HTTP/1.1 200 OK\r\n\
                     Cache-Control: max-age=3600\r\n\
                     Location: yeelight://192.168.1.37:55443\r\n\
                     model: color\r\n";
        assert_eq!(
            parse_discovery_location(reply).as_deref(),
            Some("192.168.1.37:55443")
        );
    }

    #[test]
    fn discovery_header_case_insensitive() {
        let reply = "HTTP/1.1 200 OK\r\nLOCATION: yeelight://10.0.0.2:55443\r\n";
        assert_eq!(
            parse_discovery_location(reply).as_deref(),
            Some("10.0.0.2:55443")
        );
    }

    #[test]
    fn discovery_reply_without_location_ignored() {
        assert_eq!(parse_discovery_location("HTTP/1.1 200 OK\r\nmodel: color\r\n"), None);
    }
}
