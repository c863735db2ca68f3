use std::sync::Arc;
use std::time::{Duration, Instant};

use rumqttc::{Client, Connection, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use super::{
    dispatch, ConnectOptions, Delivery, DeliveryMode, InboundHandler, Link, Transport,
    TransportError,
};

/// Single-threaded transport. `connect()` performs the handshake synchronously
/// and fires the connect result inline; afterwards nothing is delivered until
/// `pump()` is called. Outbound packets are also flushed only while pumping.
///
/// Must be used outside of any tokio runtime, the blocking `Connection` drives
/// its own.
pub struct CooperativeTransport {
    capacity: usize,
    poll_timeout: Duration,
    connect_timeout: Duration,
    client: Option<Client>,
    connection: Option<Connection>,
    handler: Option<Arc<dyn InboundHandler>>,
    connected: bool,
}

impl CooperativeTransport {
    pub fn new(capacity: usize, poll_timeout: Duration) -> Self {
        Self {
            capacity,
            poll_timeout,
            connect_timeout: Duration::from_secs(10),
            client: None,
            connection: None,
            handler: None,
            connected: false,
        }
    }

    fn release(&mut self) {
        self.client = None;
        self.connection = None;
        self.handler = None;
        self.connected = false;
    }
}

impl Default for CooperativeTransport {
    fn default() -> Self {
        Self::new(100, Duration::from_millis(10))
    }
}

impl Link for CooperativeTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        Link::publish(
            self.client.as_ref().ok_or(TransportError::NotConnected)?,
            topic,
            payload,
        )
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        Link::subscribe(
            self.client.as_ref().ok_or(TransportError::NotConnected)?,
            topic,
        )
    }
}

impl Transport for CooperativeTransport {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Cooperative
    }

    fn connect(
        &mut self,
        options: &ConnectOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError> {
        if self.client.is_some() {
            warn!("Cooperative transport already connected, ignoring connect");
            return Ok(());
        }

        self.connect_timeout = options.connect_timeout;
        let (client, mut connection) = Client::new(options.mqtt_options(), self.capacity);
        info!(
            "Connecting to {}:{} (tls: {})",
            options.server,
            options.port,
            options.uses_tls()
        );

        match await_connack(&mut connection, options.connect_timeout) {
            Ok(()) => {
                self.client = Some(client.clone());
                self.connection = Some(connection);
                self.handler = Some(handler.clone());
                self.connected = true;
                handler.on_connect(&client, Ok(()));
                Ok(())
            }
            Err(err) => {
                error!("Connection handshake failed: {}", err);
                handler.on_connect(&client, Err(err.clone()));
                Err(err)
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(client) = self.client.take() else {
            debug!("Cooperative transport already closed");
            return Ok(());
        };

        if let Err(e) = client.try_disconnect() {
            warn!("Failed to queue disconnect: {}", e);
        } else if let Some(connection) = self.connection.as_mut() {
            // flush the disconnect packet
            let deadline = Instant::now() + self.poll_timeout.max(Duration::from_millis(500));
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                match connection.recv_timeout(remaining) {
                    Ok(Ok(event)) if Delivery::from_event(&event) == Delivery::Closed => break,
                    Ok(Ok(_)) => continue,
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }

        self.release();
        Ok(())
    }

    fn pump(&mut self) -> Result<(), TransportError> {
        let (Some(connection), Some(client), Some(handler)) = (
            self.connection.as_mut(),
            self.client.clone(),
            self.handler.clone(),
        ) else {
            return Err(TransportError::NotConnected);
        };

        let failure = loop {
            // a reconnect needs the full handshake window
            let wait = if self.connected {
                self.poll_timeout
            } else {
                self.connect_timeout
            };

            match connection.recv_timeout(wait) {
                Ok(Ok(event)) => {
                    if !dispatch(&event, &client, handler.as_ref(), &mut self.connected) {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => break TransportError::from_connection(&e),
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(RecvTimeoutError::Disconnected) => return Err(TransportError::NotConnected),
            }
        };

        if failure.is_fatal() {
            handler.on_connect(&client, Err(failure.clone()));
            self.release();
        } else if self.connected {
            self.connected = false;
            handler.on_connection_lost(&failure);
        } else {
            handler.on_connect(&client, Err(failure.clone()));
        }
        Err(failure)
    }
}

fn await_connack(connection: &mut Connection, timeout: Duration) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(TransportError::Connect(format!(
                "no ConnAck within {:?}",
                timeout
            )));
        };

        match connection.recv_timeout(remaining) {
            Ok(Ok(event)) => {
                if Delivery::from_event(&event) == Delivery::Connected {
                    return Ok(());
                }
                debug!("Handshake event: {:?}", event);
            }
            Ok(Err(e)) => return Err(TransportError::from_connection(&e)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TransportError::Connect("event loop closed".to_string()))
            }
        }
    }
}
