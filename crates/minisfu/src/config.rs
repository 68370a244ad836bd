use serde::Deserialize;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::Result;

const ENV_PREFIX: &str = "MINISFU";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Log a forwarding summary every this many packets per router.
    pub forward_log_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            forward_log_interval: 100,
        }
    }
}

impl SfuConfig {
    /// Load configuration from an optional file, then `MINISFU_*` environment
    /// variables (e.g. `MINISFU_STUN_SERVERS=stun:a,stun:b`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("stun_servers")
                    .try_parsing(true),
            )
            .build()?;

        let config: SfuConfig = config.try_deserialize()?;
        if config.stun_servers.is_empty() && config.turn_servers.is_empty() {
            tracing::warn!("No ICE servers configured, only host candidates will be gathered");
        }

        Ok(config)
    }

    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in &self.stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}
