use std::net::ToSocketAddrs;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::DeviceConfig;
use crate::transport::TransportError;

/// Network family the device reaches the broker through. Informational on
/// hosted targets where the OS owns the interfaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkFamily {
    #[default]
    Default,
    Ethernet,
    Wifi,
    Cellular,
}

/// Supplies the device identity and performs network bring-up.
pub trait CredentialSource {
    fn client_id(&self) -> &str;
    fn api_key(&self) -> &str;
    /// Broker port; the secure port selects TLS.
    fn port(&self) -> u16;
    fn network(&self) -> NetworkFamily;
    fn network_connect(&mut self, server: &str) -> Result<(), TransportError>;
}

#[derive(Clone, Debug)]
pub struct DeviceCredentials {
    client_id: String,
    api_key: String,
    port: u16,
    network: NetworkFamily,
}

impl DeviceCredentials {
    pub fn new(
        client_id: impl Into<String>,
        api_key: impl Into<String>,
        port: u16,
        network: NetworkFamily,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            api_key: api_key.into(),
            port,
            network,
        }
    }
}

impl From<&DeviceConfig> for DeviceCredentials {
    fn from(config: &DeviceConfig) -> Self {
        Self::new(
            config.client_id.clone(),
            config.api_key.clone(),
            config.port,
            config.network,
        )
    }
}

impl CredentialSource for DeviceCredentials {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn api_key(&self) -> &str {
        &self.api_key
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn network(&self) -> NetworkFamily {
        self.network
    }

    // The OS brings the interface up; we only check the broker is reachable by name.
    fn network_connect(&mut self, server: &str) -> Result<(), TransportError> {
        info!("Bringing up {:?} network for {}", self.network, server);
        let mut addrs = (server, self.port).to_socket_addrs().map_err(|e| {
            error!("Cannot resolve {}: {}", server, e);
            TransportError::Connect(format!("cannot resolve {}: {}", server, e))
        })?;

        match addrs.next() {
            Some(addr) => {
                debug!("Broker {} resolves to {}", server, addr);
                Ok(())
            }
            None => Err(TransportError::Connect(format!(
                "{} resolved to no addresses",
                server
            ))),
        }
    }
}
