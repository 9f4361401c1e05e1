//! Configuration types for the operation channel.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use opchannel_core::Credentials;

/// Everything needed to reach the server and shape outbound requests.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `host[:port]` of the server.
    pub host: String,
    /// Use `wss://` instead of `ws://`.
    pub use_tls: bool,
    /// Path of the duplex endpoint on the host.
    pub path: String,
    /// Tenant sent in `tenant_header` during the upgrade.
    pub tenant: String,
    /// Name of the tenant header.
    pub tenant_header: String,
    /// Injected into every payload and used for the Basic auth header.
    pub credentials: Credentials,
    /// How long `connect()` waits for the upgrade and the session message.
    pub handshake_timeout: Duration,
    /// Payload field the server echoes back to identify the request.
    pub correlation_field: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "localhost:8080".to_string(),
            use_tls: false,
            path: "/command-gateway/ui/ws".to_string(),
            tenant: "default".to_string(),
            tenant_header: "Tenant".to_string(),
            credentials: Credentials::default(),
            handshake_timeout: Duration::from_secs(10),
            correlation_field: "resourcePath".to_string(),
        }
    }
}

impl ChannelConfig {
    /// Full URL of the duplex endpoint.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{scheme}://{}{}", self.host, self.path)
    }

    /// `Basic base64(username:password)`, when both are configured.
    #[must_use]
    pub fn basic_auth_header(&self) -> Option<String> {
        let (user, pass) = self.credentials.basic_pair()?;
        Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.host, "localhost:8080");
        assert!(!config.use_tls);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.correlation_field, "resourcePath");
        assert!(config.basic_auth_header().is_none());
    }

    #[test]
    fn endpoint_url_follows_tls_flag() {
        let mut config = ChannelConfig {
            host: "agent.example:8443".into(),
            path: "/ws".into(),
            ..ChannelConfig::default()
        };
        assert_eq!(config.endpoint_url(), "ws://agent.example:8443/ws");
        config.use_tls = true;
        assert_eq!(config.endpoint_url(), "wss://agent.example:8443/ws");
    }

    #[test]
    fn basic_auth_header_encodes_pair() {
        let config = ChannelConfig {
            credentials: Credentials::basic("jdoe", "password"),
            ..ChannelConfig::default()
        };
        assert_eq!(
            config.basic_auth_header().as_deref(),
            Some("Basic amRvZTpwYXNzd29yZA==")
        );
    }
}
