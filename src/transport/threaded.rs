use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, EventLoop};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    dispatch, ConnectOptions, Delivery, DeliveryMode, InboundHandler, Link, Transport,
    TransportError,
};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const FLUSH_GRACE: Duration = Duration::from_millis(500);

/// Transport whose network I/O and inbound delivery run on a background tokio
/// task, started by `connect()`. Handlers are invoked from that task, so the
/// caller's thread and the delivery task touch session state concurrently.
///
/// `disconnect()` blocks briefly on the owned runtime and must not be called
/// from inside another async runtime.
pub struct ThreadedTransport {
    capacity: usize,
    reconnect_delay: Duration,
    runtime: Option<Runtime>,
    client: Option<AsyncClient>,
    worker: Option<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl ThreadedTransport {
    pub fn new(capacity: usize, reconnect_delay: Duration) -> Self {
        Self {
            capacity,
            reconnect_delay,
            runtime: None,
            client: None,
            worker: None,
            shutdown: None,
        }
    }
}

impl Default for ThreadedTransport {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(5))
    }
}

impl Link for ThreadedTransport {
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

impl Transport for ThreadedTransport {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Threaded
    }

    /// Waits for the first ConnAck on the owned runtime, then hands the event
    /// loop to the delivery task. A failed first attempt is returned and not
    /// retried; only an established connection is re-opened after a drop.
    fn connect(
        &mut self,
        options: &ConnectOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError> {
        if self.client.is_some() {
            warn!("Threaded transport already connected, ignoring connect");
            return Ok(());
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("mqtt-delivery")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Runtime(e.to_string()))?;

        let (client, mut eventloop) = AsyncClient::new(options.mqtt_options(), self.capacity);
        info!(
            "Connecting to {}:{} (tls: {})",
            options.server,
            options.port,
            options.uses_tls()
        );

        let handshake = runtime.block_on(async {
            tokio::time::timeout(options.connect_timeout, first_connack(&mut eventloop)).await
        });
        let outcome = handshake.unwrap_or_else(|_| {
            Err(TransportError::Connect(format!(
                "no ConnAck within {:?}",
                options.connect_timeout
            )))
        });

        if let Err(err) = outcome {
            error!("Connection handshake failed: {}", err);
            handler.on_connect(&client, Err(err.clone()));
            runtime.shutdown_background();
            return Err(err);
        }
        handler.on_connect(&client, Ok(()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        debug!("Starting delivery task");
        let worker = runtime.spawn(run_delivery(
            eventloop,
            client.clone(),
            handler,
            self.reconnect_delay,
            shutdown_rx,
        ));

        self.runtime = Some(runtime);
        self.client = Some(client);
        self.worker = Some(worker);
        self.shutdown = Some(shutdown_tx);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let Some(client) = self.client.take() else {
            debug!("Threaded transport already closed");
            return Ok(());
        };

        if let Err(e) = client.try_disconnect() {
            warn!("Failed to queue disconnect: {}", e);
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }

        if let (Some(runtime), Some(worker)) = (self.runtime.take(), self.worker.take()) {
            let finished = runtime.block_on(async {
                tokio::time::timeout(DISCONNECT_GRACE, worker).await
            });
            if finished.is_err() {
                warn!("Delivery task did not stop within {:?}", DISCONNECT_GRACE);
            }
            runtime.shutdown_timeout(DISCONNECT_GRACE);
        }
        Ok(())
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn first_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(event) if Delivery::from_event(&event) == Delivery::Connected => return Ok(()),
            Ok(event) => debug!("Handshake event: {:?}", event),
            Err(e) => return Err(TransportError::from_connection(&e)),
        }
    }
}

async fn run_delivery(
    mut eventloop: EventLoop,
    link: AsyncClient,
    handler: Arc<dyn InboundHandler>,
    reconnect_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connected = true;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if connected {
                    flush_disconnect(&mut eventloop).await;
                }
                info!("Shutdown requested, stopping delivery task");
                break;
            }
            event = eventloop.poll() => match event {
                Ok(event) => {
                    if !dispatch(&event, &link, handler.as_ref(), &mut connected) {
                        info!("Disconnect sent, stopping delivery task");
                        break;
                    }
                }
                Err(e) => {
                    let err = TransportError::from_connection(&e);
                    if err.is_fatal() {
                        error!("Broker refused connection: {}", e);
                        handler.on_connect(&link, Err(err));
                        break;
                    }
                    if connected {
                        connected = false;
                        handler.on_connection_lost(&err);
                    } else {
                        handler.on_connect(&link, Err(err));
                    }
                    warn!("Connection error, retrying in {:?}: {}", reconnect_delay, e);
                    tokio::select! {
                        _ = shutdown.changed() => {
                            info!("Shutdown requested during reconnect backoff");
                            break;
                        }
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }
    }
}

// drives the event loop until the queued Disconnect has been written
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(FLUSH_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(event) if Delivery::from_event(&event) == Delivery::Closed => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("Disconnect not flushed within {:?}", FLUSH_GRACE);
    }
}
