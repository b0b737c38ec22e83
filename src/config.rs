// Application configuration.
// Logging defaults to on in debug builds and off in release builds.

use crate::error::CallError;
use crate::peer::types::ServerConfig;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Base unit of the capture retry backoff; attempt `n` waits `n` units.
pub const MEDIA_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Extra capture attempts after the first one fails with a transient error.
pub const MEDIA_MAX_RETRIES: u32 = 2;

/// How long an ICE server probe waits for a matching candidate.
pub const ICE_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a session may sit in `Recovering` before the link counts as lost.
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(10);

/// Early candidates kept per call while its offer is still in flight.
pub const MAX_EARLY_CANDIDATES: usize = 64;

/// Distinct call ids that may hold early candidates at once.
pub const MAX_EARLY_CALLS: usize = 8;

/// Ended call ids remembered so late candidates for them are dropped.
pub const RECENT_CALLS: usize = 32;

/// Settings fixed for the lifetime of a call controller.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub media_retry_backoff: Duration,
    pub media_max_retries: u32,
    pub ice_probe_timeout: Duration,
    pub restart_timeout: Duration,
    pub logging: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            media_retry_backoff: MEDIA_RETRY_BACKOFF,
            media_max_retries: MEDIA_MAX_RETRIES,
            ice_probe_timeout: ICE_PROBE_TIMEOUT,
            restart_timeout: RESTART_TIMEOUT,
            logging: LOGGING_ENABLED,
        }
    }
}

impl CallConfig {
    /// Replaces the ICE server list after validating every entry.
    pub fn with_ice_servers(mut self, servers: Vec<ServerConfig>) -> Result<Self, CallError> {
        log::info!("Setting {} custom ICE servers", servers.len());
        for server in &servers {
            validate_server(server)?;
        }
        self.ice_servers = servers;
        Ok(self)
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

pub fn validate_server(server: &ServerConfig) -> Result<(), CallError> {
    if server.url.trim().is_empty() {
        return Err(CallError::Config(format!(
            "server {} has an empty url",
            server.id
        )));
    }
    if server.r#type != "stun" && server.r#type != "turn" {
        return Err(CallError::Config(format!(
            "server {} has unknown type {:?}",
            server.id, server.r#type
        )));
    }
    if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
        return Err(CallError::Config(format!(
            "TURN server {} requires username and credential",
            server.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(username: Option<&str>) -> ServerConfig {
        ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: username.map(String::from),
            credential: username.map(|_| "secret".to_string()),
        }
    }

    #[test]
    fn defaults_use_public_stun_pair() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.media_retry_backoff, Duration::from_millis(500));
        assert_eq!(config.media_max_retries, 2);
        assert_eq!(config.restart_timeout, Duration::from_secs(10));
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = CallConfig::default()
            .with_ice_servers(vec![turn(None)])
            .unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn valid_servers_replace_defaults() {
        let config = CallConfig::default()
            .with_ice_servers(vec![turn(Some("alice"))])
            .unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].id, "relay");
    }

    #[test]
    fn empty_url_is_rejected() {
        let mut server = turn(Some("alice"));
        server.url = "  ".into();
        assert!(validate_server(&server).is_err());
    }
}
