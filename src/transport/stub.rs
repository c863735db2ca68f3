//! Loopback broker for exercising the real transports. Every connection gets
//! one fixed CONNACK in reply to its first packet and nothing else.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::{ConnectOptions, InboundHandler, Link, TransportError};

#[derive(Clone, Copy)]
enum Behaviour {
    Accept,
    AcceptThenDrop,
    Refuse(u8),
}

pub(crate) struct StubBroker {
    pub(crate) port: u16,
    connections: Arc<AtomicUsize>,
}

impl StubBroker {
    /// Acknowledges the connection and keeps it open.
    pub(crate) fn accepting() -> Self {
        Self::start(Behaviour::Accept)
    }

    /// Acknowledges the connection, then hangs up.
    pub(crate) fn dropping() -> Self {
        Self::start(Behaviour::AcceptThenDrop)
    }

    /// Answers with the given CONNACK return code.
    pub(crate) fn refusing(code: u8) -> Self {
        Self::start(Behaviour::Refuse(code))
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn start(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || serve(stream, behaviour));
            }
        });

        Self { port, connections }
    }
}

fn serve(mut stream: TcpStream, behaviour: Behaviour) {
    let mut buf = [0u8; 1024];
    if !matches!(stream.read(&mut buf), Ok(n) if n > 0) {
        return;
    }

    let code = match behaviour {
        Behaviour::Refuse(code) => code,
        Behaviour::Accept | Behaviour::AcceptThenDrop => 0x00,
    };
    if stream.write_all(&[0x20, 0x02, 0x00, code]).is_err() {
        return;
    }
    let _ = stream.flush();

    if matches!(behaviour, Behaviour::Accept) {
        while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
    }
}

/// A port nothing listens on.
pub(crate) fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub(crate) fn local_options(port: u16) -> ConnectOptions {
    ConnectOptions {
        server: "127.0.0.1".to_string(),
        port,
        client_id: "device-1".to_string(),
        username: "json+device".to_string(),
        password: "secret".to_string(),
        keepalive: Duration::from_secs(60),
        connect_timeout: Duration::from_secs(2),
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Seen {
    Connected,
    Failed(TransportError),
    Lost,
    Message(String),
}

/// Handler that only remembers what it was told.
#[derive(Default)]
pub(crate) struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub(crate) fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn push(&self, seen: Seen) {
        self.seen.lock().unwrap().push(seen);
    }
}

impl InboundHandler for Recorder {
    fn on_connect(&self, _link: &dyn Link, result: Result<(), TransportError>) {
        self.push(match result {
            Ok(()) => Seen::Connected,
            Err(e) => Seen::Failed(e),
        });
    }

    fn on_message(&self, _link: &dyn Link, topic: &str, _payload: &[u8]) {
        self.push(Seen::Message(topic.to_string()));
    }

    fn on_connection_lost(&self, _error: &TransportError) {
        self.push(Seen::Lost);
    }
}
