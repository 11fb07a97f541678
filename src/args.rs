use clap::Parser;
use p2p_call_core::config::{self, Config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "p2p-call")]
#[command(author = "Selkies Team")]
#[command(version)]
#[command(about = "Two-party peer-to-peer video call", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/p2p-call.toml")]
    pub config: PathBuf,

    /// Signaling relay URL (overrides [signaling] url)
    #[arg(short, long)]
    pub server: Option<String>,

    /// Room to join
    #[arg(short, long, default_value = "demo")]
    pub room: String,

    /// Display name (overrides [user] nickname)
    #[arg(short, long)]
    pub nickname: Option<String>,

    /// Join with the microphone muted
    #[arg(long, action)]
    pub no_audio: bool,

    /// Join with the camera off
    #[arg(long, action)]
    pub no_video: bool,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    /// Run a self-contained two-party call over in-process loopbacks
    #[arg(long, action)]
    pub demo: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Command-line flags win over file values
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref server) = self.server {
            config.signaling.url = server.clone();
        }
        if let Some(ref nickname) = self.nickname {
            config.user.nickname = Some(nickname.clone());
        }
        if self.no_audio {
            config.media.audio_enabled = false;
        }
        if self.no_video {
            config.media.video_enabled = false;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let args = Args::parse_from([
            "p2p-call",
            "--server",
            "wss://relay.example.com",
            "--nickname",
            "Brave Lion",
            "--no-video",
        ]);
        let mut config = Config::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.signaling.url, "wss://relay.example.com");
        assert_eq!(config.user.nickname.as_deref(), Some("Brave Lion"));
        assert!(config.media.audio_enabled);
        assert!(!config.media.video_enabled);
        assert_eq!(args.room, "demo");
    }
}
