use super::call_api::CallController;
use crate::config::validate_server;
use crate::error::CallError;
use crate::peer::ice::probe_ice_server;
use crate::peer::types::ServerConfig;
use log::info;

impl CallController {
    /// Configured STUN/TURN servers every session uses.
    pub fn ice_servers(&self) -> &[ServerConfig] {
        &self.context.config.ice_servers
    }

    /// Validates `server` and checks that it hands out the candidates its
    /// type promises within the configured probe timeout.
    pub async fn check_ice_server_availability(
        &self,
        server: &ServerConfig,
    ) -> Result<bool, CallError> {
        validate_server(server)?;
        let available = probe_ice_server(server, self.context.config.ice_probe_timeout).await?;
        info!(
            "ICE server {} is {}",
            server.id,
            if available { "available" } else { "unavailable" }
        );
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_ice_servers;
    use crate::session::tests::Harness;

    #[test]
    fn controller_exposes_configured_servers() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("alice", h.context.clone());
        assert_eq!(calls.ice_servers(), default_ice_servers().as_slice());
    }

    #[tokio::test]
    async fn invalid_server_is_rejected_before_probing() {
        let h = Harness::new(vec![]);
        let calls = CallController::new("alice", h.context.clone());
        let server = ServerConfig {
            id: "relay".into(),
            r#type: "turn".into(),
            url: "relay.example.org:3478".into(),
            username: None,
            credential: None,
        };
        let err = calls
            .check_ice_server_availability(&server)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "config");
    }
}
