use cm_common::crypto;
use cm_common::Endpoint;
use rsa::RsaPublicKey;
use std::net::IpAddr;
use std::time::Duration;

/// Runtime configuration for a [`CmClient`](crate::CmClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Explicit CM endpoint. When unset, one is picked at random from the
    /// server directory on every connection attempt.
    pub server: Option<Endpoint>,
    /// Local address to bind before connecting.
    pub local_addr: Option<IpAddr>,
    /// Local port to bind before connecting.
    pub local_port: Option<u16>,
    /// TCP connect timeout. The same duration bounds the first read until
    /// the CM opens the channel-encrypt exchange.
    pub connect_timeout: Duration,
    /// Reconnect automatically while the channel has not yet been
    /// encrypted. Never applies after an encrypted session drops.
    pub auto_retry: bool,
    /// RSA key the session key is wrapped with. Defaults to the CM fleet's
    /// well-known key.
    pub channel_key: RsaPublicKey,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            local_addr: None,
            local_port: None,
            connect_timeout: Duration::from_secs(1),
            auto_retry: true,
            channel_key: crypto::well_known_key().clone(),
        }
    }
}

impl ClientConfig {
    /// Validates the configuration values are within acceptable bounds.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout.is_zero() {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        if let Some(server) = &self.server {
            if server.host.is_empty() {
                return Err("server host must not be empty".to_string());
            }
            if server.port == 0 {
                return Err("server port must not be zero".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn default_connect_timeout_is_one_second() {
        assert_eq!(
            ClientConfig::default().connect_timeout,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn default_retries_automatically() {
        assert!(ClientConfig::default().auto_retry);
    }

    #[test]
    fn zero_connect_timeout_is_rejected() {
        let config = ClientConfig {
            connect_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("connect_timeout"));
    }

    #[test]
    fn empty_server_host_is_rejected() {
        let config = ClientConfig {
            server: Some(Endpoint::new("", 27017)),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("host"));
    }

    #[test]
    fn zero_server_port_is_rejected() {
        let config = ClientConfig {
            server: Some(Endpoint::new("162.254.196.40", 0)),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("port"));
    }
}
