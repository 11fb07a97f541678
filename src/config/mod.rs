//! Configuration management for p2p-call

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod preferences;

pub use preferences::{random_nickname, MediaPreferences};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Signaling relay configuration
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Media capture configuration
    #[serde(default)]
    pub media: MediaConfig,

    /// Participant identity
    #[serde(default)]
    pub user: UserConfig,

    /// WebRTC configuration
    #[serde(default)]
    pub webrtc: WebRTCConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay endpoint (`ws://` or `wss://`)
    #[serde(default = "default_signaling_url")]
    pub url: String,

    /// Seconds between WebSocket keepalive pings (0 disables them)
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for the relay handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            ping_interval_secs: default_ping_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Start with the microphone unmuted
    #[serde(default = "default_true")]
    pub audio_enabled: bool,

    /// Start with the camera on
    #[serde(default = "default_true")]
    pub video_enabled: bool,

    /// Preferred microphone device id
    #[serde(default)]
    pub audio_device: Option<String>,

    /// Preferred camera device id
    #[serde(default)]
    pub video_device: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            audio_device: None,
            video_device: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    /// Display name announced on join; random when unset
    #[serde(default)]
    pub nickname: Option<String>,
}

/// A single ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

/// WebRTC connectivity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRTCConfig {
    /// STUN server host (empty disables STUN)
    #[serde(default = "default_stun_host")]
    pub stun_host: String,

    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    /// TURN server host (empty disables TURN)
    #[serde(default)]
    pub turn_host: String,

    #[serde(default = "default_turn_port")]
    pub turn_port: u16,

    /// TURN transport ("udp" or "tcp")
    #[serde(default = "default_turn_protocol")]
    pub turn_protocol: String,

    /// Use `turns:` instead of `turn:`
    #[serde(default)]
    pub turn_tls: bool,

    #[serde(default)]
    pub turn_username: String,

    #[serde(default)]
    pub turn_password: String,

    /// Explicit ICE servers, used when neither STUN nor TURN is configured
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for WebRTCConfig {
    fn default() -> Self {
        Self {
            stun_host: default_stun_host(),
            stun_port: default_stun_port(),
            turn_host: String::new(),
            turn_port: default_turn_port(),
            turn_protocol: default_turn_protocol(),
            turn_tls: false,
            turn_username: String::new(),
            turn_password: String::new(),
            ice_servers: Vec::new(),
        }
    }
}

impl WebRTCConfig {
    /// Effective ICE server list for a new peer connection
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        let mut servers = Vec::new();

        if !self.stun_host.is_empty() && self.stun_port != 0 {
            servers.push(IceServerConfig {
                urls: vec![format!("stun:{}:{}", self.stun_host, self.stun_port)],
                username: None,
                credential: None,
            });
        }

        if !self.turn_host.is_empty() {
            let scheme = if self.turn_tls { "turns" } else { "turn" };
            let transport = if self.turn_protocol.is_empty() {
                "udp"
            } else {
                self.turn_protocol.as_str()
            };
            servers.push(IceServerConfig {
                urls: vec![format!(
                    "{}:{}:{}?transport={}",
                    scheme, self.turn_host, self.turn_port, transport
                )],
                username: Some(self.turn_username.clone()),
                credential: Some(self.turn_password.clone()),
            });
        }

        if servers.is_empty() {
            return self.ice_servers.clone();
        }

        servers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        let url = self.signaling.url.trim();
        if url.is_empty() {
            return Err("Signaling URL must not be empty".into());
        }
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err("Signaling URL must start with ws:// or wss://".into());
        }
        if self.signaling.connect_timeout_secs == 0 {
            return Err("Signaling connect timeout must be non-zero".into());
        }

        if !self.webrtc.stun_host.is_empty() && self.webrtc.stun_port == 0 {
            return Err("WebRTC stun_port must be non-zero when stun_host is set".into());
        }

        if !self.webrtc.turn_host.is_empty() {
            if self.webrtc.turn_username.is_empty() || self.webrtc.turn_password.is_empty() {
                return Err("WebRTC TURN server requires turn_username and turn_password".into());
            }
            let protocol = self.webrtc.turn_protocol.to_ascii_lowercase();
            if protocol != "udp" && protocol != "tcp" {
                return Err("WebRTC turn_protocol must be \"udp\" or \"tcp\"".into());
            }
        }

        for server in &self.webrtc.ice_servers {
            if server.urls.is_empty() {
                return Err("WebRTC ice_servers entries need at least one url".into());
            }
        }

        Ok(())
    }

    /// Media preferences derived from the `[media]` section
    pub fn media_preferences(&self) -> MediaPreferences {
        MediaPreferences::from(&self.media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.signaling.url, "ws://localhost:3001");
        assert!(cfg.media.audio_enabled && cfg.media.video_enabled);
    }

    #[test]
    fn validate_rejects_non_websocket_url() {
        let mut cfg = Config::default();
        cfg.signaling.url = "http://localhost:3001".to_string();
        assert!(cfg.validate().is_err());
        cfg.signaling.url = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut cfg = Config::default();
        cfg.signaling.connect_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_turn_requires_credentials() {
        let mut cfg = Config::default();
        cfg.webrtc.turn_host = "turn.example.com".to_string();
        assert!(cfg.validate().is_err());
        cfg.webrtc.turn_username = "alice".to_string();
        cfg.webrtc.turn_password = "secret".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [signaling]
            url = "wss://relay.example.com"

            [media]
            video_enabled = false
            video_device = "usb-cam"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.signaling.url, "wss://relay.example.com");
        assert_eq!(cfg.signaling.ping_interval_secs, 30);
        assert!(cfg.media.audio_enabled);
        assert!(!cfg.media.video_enabled);
        assert_eq!(cfg.media.video_device.as_deref(), Some("usb-cam"));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn ice_servers_prefer_stun_and_turn() {
        let mut webrtc = WebRTCConfig {
            stun_host: String::new(),
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:fallback.example.com:3478".to_string()],
                username: None,
                credential: None,
            }],
            ..Default::default()
        };
        assert_eq!(webrtc.ice_servers().len(), 1);
        assert_eq!(webrtc.ice_servers()[0].urls[0], "stun:fallback.example.com:3478");

        webrtc.stun_host = "stun.example.com".to_string();
        webrtc.turn_host = "turn.example.com".to_string();
        webrtc.turn_tls = true;
        webrtc.turn_username = "u".to_string();
        webrtc.turn_password = "p".to_string();
        let servers = webrtc.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls[0], "stun:stun.example.com:19302");
        assert_eq!(servers[1].urls[0], "turns:turn.example.com:3478?transport=udp");
        assert_eq!(servers[1].username.as_deref(), Some("u"));
    }
}

fn default_true() -> bool {
    true
}

fn default_signaling_url() -> String {
    "ws://localhost:3001".to_string()
}

fn default_ping_interval_secs() -> u64 { 30 }
fn default_connect_timeout_secs() -> u64 { 10 }

fn default_stun_host() -> String {
    "stun.l.google.com".to_string()
}

fn default_stun_port() -> u16 { 19302 }
fn default_turn_port() -> u16 { 3478 }

fn default_turn_protocol() -> String {
    "udp".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}
