//! In-process transport used by the engine tests. Records every publish and
//! subscription and queues inbound messages until `pump()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{ConnectOptions, DeliveryMode, InboundHandler, Link, Transport, TransportError};

#[derive(Clone, Default)]
pub(crate) struct Wire {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<VecDeque<(String, Vec<u8>)>>>,
}

impl Wire {
    pub(crate) fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(topic, body)| (topic.clone(), serde_json::from_slice(body).unwrap()))
            .collect()
    }

    pub(crate) fn published_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, body)| body)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    pub(crate) fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub(crate) fn inject(&self, topic: &str, body: impl Into<Vec<u8>>) {
        self.inbound
            .lock()
            .unwrap()
            .push_back((topic.to_string(), body.into()));
    }
}

pub(crate) struct MemoryTransport {
    wire: Wire,
    handler: Option<Arc<dyn InboundHandler>>,
    refusal: Option<TransportError>,
    pub(crate) fail_publish: bool,
    pub(crate) disconnects: usize,
}

impl MemoryTransport {
    pub(crate) fn new() -> (Self, Wire) {
        let wire = Wire::default();
        let transport = Self {
            wire: wire.clone(),
            handler: None,
            refusal: None,
            fail_publish: false,
            disconnects: 0,
        };
        (transport, wire)
    }

    /// Fails every connect attempt with `err`.
    pub(crate) fn refusing(err: TransportError) -> (Self, Wire) {
        let (mut transport, wire) = Self::new();
        transport.refusal = Some(err);
        (transport, wire)
    }

    pub(crate) fn refusing_credentials() -> (Self, Wire) {
        Self::refusing(TransportError::Auth("BadUserNamePassword".to_string()))
    }
}

impl Link for MemoryTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.fail_publish {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "queue full".to_string(),
            });
        }
        self.wire
            .published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.wire
            .subscriptions
            .lock()
            .unwrap()
            .push(topic.to_string());
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Cooperative
    }

    fn connect(
        &mut self,
        _options: &ConnectOptions,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError> {
        if let Some(err) = self.refusal.clone() {
            handler.on_connect(self, Err(err.clone()));
            return Err(err);
        }
        self.handler = Some(handler.clone());
        handler.on_connect(self, Ok(()));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.handler.take().is_some() {
            self.disconnects += 1;
        }
        Ok(())
    }

    fn pump(&mut self) -> Result<(), TransportError> {
        let handler = self.handler.clone().ok_or(TransportError::NotConnected)?;
        loop {
            let next = self.wire.inbound.lock().unwrap().pop_front();
            let Some((topic, body)) = next else {
                return Ok(());
            };
            handler.on_message(self, &topic, &body);
        }
    }
}
