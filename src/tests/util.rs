use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Ipv6Addr, SocketAddr};
use std::ops::RangeFrom;
use std::str;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use bytes::Bytes;
use lazy_static::lazy_static;
use tracing::info_span;

use crate::crypto::plain;
use crate::segment::{ChunkQueue, ChunkQueueHandle};
use crate::*;

/// A client endpoint and a listener exchanging datagrams in memory over a
/// virtual clock. Packets fly instantly; time only moves via [`Pair::advance`].
pub struct Pair {
    pub server: TestListener,
    pub client: TestClient,
    pub time: Microseconds,
    /// Blackhole client->server datagrams (simulated outage)
    pub drop_to_server: bool,
    /// Blackhole server->client datagrams
    pub drop_to_client: bool,
}

impl Pair {
    pub fn new(server_config: ListenerConfig) -> Self {
        let server_addr = SocketAddr::new(
            Ipv6Addr::LOCALHOST.into(),
            SERVER_PORTS.lock().unwrap().next().unwrap(),
        );
        let client_addr = SocketAddr::new(
            Ipv6Addr::LOCALHOST.into(),
            CLIENT_PORTS.lock().unwrap().next().unwrap(),
        );
        let listener = Listener::new(server_config, Arc::new(TransportContext::new())).unwrap();
        Self {
            server: TestListener {
                listener,
                addr: server_addr,
                inbound: VecDeque::new(),
                events: VecDeque::new(),
                sent: Vec::new(),
                chunks: None,
            },
            client: TestClient {
                conn: None,
                ctx: Arc::new(TransportContext::new()),
                addr: client_addr,
                inbound: VecDeque::new(),
                sent: Vec::new(),
                chunks: None,
            },
            time: 1_000_000_000_000,
            drop_to_server: false,
            drop_to_client: false,
        }
    }

    /// Pump packets until nothing more is in flight. Does not advance time.
    pub fn drive(&mut self) {
        while self.step() {}
    }

    pub fn step(&mut self) -> bool {
        let mut progress = false;
        progress |= self.flush_client();
        progress |= self.flush_server();
        progress |= self.deliver();
        progress
    }

    /// Move the clock and fire both sides' timers, then pump packets
    pub fn advance(&mut self, delta: Microseconds) {
        self.time += delta;
        if let Some(conn) = &mut self.client.conn {
            conn.handle_timeout(self.time);
        }
        self.server.listener.handle_timeout(self.time);
        self.drive();
    }

    fn flush_client(&mut self) -> bool {
        let span = info_span!("client");
        let _guard = span.enter();
        let mut progress = false;
        if let Some(conn) = &mut self.client.conn {
            while let Some(transmit) = conn.poll_transmit() {
                progress = true;
                if transmit.destination == self.server.addr && !self.drop_to_server {
                    self.server
                        .inbound
                        .push_back((self.client.addr, transmit.contents.clone()));
                }
                self.client.sent.push(transmit);
            }
        }
        progress
    }

    fn flush_server(&mut self) -> bool {
        let span = info_span!("server");
        let _guard = span.enter();
        let mut progress = false;
        while let Some(transmit) = self.server.listener.poll_transmit() {
            progress = true;
            if transmit.destination == self.client.addr && !self.drop_to_client {
                self.client.inbound.push_back(transmit.contents.clone());
            }
            self.server.sent.push(transmit);
        }
        progress
    }

    fn deliver(&mut self) -> bool {
        let mut progress = false;
        while let Some((from, pkt)) = self.server.inbound.pop_front() {
            progress = true;
            let span = info_span!("server");
            let _guard = span.enter();
            if let Some(event) = self.server.listener.handle(self.time, from, &pkt) {
                self.server.events.push_back(event);
            }
        }
        while let Some(pkt) = self.client.inbound.pop_front() {
            progress = true;
            let span = info_span!("client");
            let _guard = span.enter();
            if let Some(conn) = &mut self.client.conn {
                conn.handle(self.time, &pkt);
            }
        }
        progress
    }

    /// Inject a raw datagram into the listener, as if from `from`
    pub fn send_to_server(&mut self, from: SocketAddr, pkt: Bytes) {
        self.server.inbound.push_back((from, pkt));
    }

    /// Inject a raw datagram into the client connection
    pub fn send_to_client(&mut self, pkt: Bytes) {
        self.client.inbound.push_back(pkt);
    }

    /// Just start connecting the client
    pub fn begin_connect(&mut self, config: ClientConfig) {
        let span = info_span!("client");
        let _guard = span.enter();
        let (queue, handle) = ChunkQueue::new();
        let conn = Connection::connect(
            config,
            self.server.addr,
            Box::new(queue),
            self.client.ctx.clone(),
            self.time,
        )
        .unwrap();
        self.client.chunks = Some(handle);
        self.client.conn = Some(conn);
    }

    /// Run the full three-way handshake plus application accept
    pub fn connect(&mut self, config: ClientConfig) -> ConnectionHandle {
        self.begin_connect(config);
        self.drive();
        let ch = self.server.assert_incoming();
        self.accept(ch);
        self.drive();
        assert_matches!(self.client_conn().poll(), Some(Event::Connected));
        assert_eq!(self.client_conn().state(), State::Connected);
        assert_eq!(self.server.listener[ch].state(), State::Connected);
        ch
    }

    pub fn accept(&mut self, ch: ConnectionHandle) {
        let (queue, handle) = ChunkQueue::new();
        self.server.chunks = Some(handle);
        self.server
            .listener
            .accept_connection(self.time, ch, Box::new(queue));
    }

    pub fn client_conn(&mut self) -> &mut Connection {
        self.client.conn.as_mut().unwrap()
    }
}

pub struct TestListener {
    pub listener: Listener,
    pub addr: SocketAddr,
    pub inbound: VecDeque<(SocketAddr, Bytes)>,
    pub events: VecDeque<ListenerEvent>,
    /// Every datagram the listener side ever emitted, in order
    pub sent: Vec<Transmit>,
    pub chunks: Option<ChunkQueueHandle>,
}

impl TestListener {
    pub fn assert_incoming(&mut self) -> ConnectionHandle {
        match self.events.pop_front() {
            Some(ListenerEvent::Incoming(ch)) => ch,
            other => panic!("expected an incoming connection, got {other:?}"),
        }
    }
}

pub struct TestClient {
    pub conn: Option<Connection>,
    pub ctx: Arc<TransportContext>,
    pub addr: SocketAddr,
    pub inbound: VecDeque<Bytes>,
    pub sent: Vec<Transmit>,
    pub chunks: Option<ChunkQueueHandle>,
}

/// Listener whose certs assert the named identity
pub fn server_config(name: &str) -> ListenerConfig {
    let identity = Identity::Named(name.into());
    ListenerConfig {
        crypto: Arc::new(plain::Provider::new(Some(identity.clone()), true)),
        local_identity: identity,
        connection: ConnectionConfig::default(),
    }
}

/// Client whose certs assert the named identity
pub fn client_config(name: &str) -> ClientConfig {
    let identity = Identity::Named(name.into());
    ClientConfig {
        crypto: Arc::new(plain::Provider::new(Some(identity.clone()), true)),
        local_identity: identity,
        connection: ConnectionConfig::default(),
    }
}

/// Anonymous client: no cert, localhost identity
pub fn anonymous_client_config() -> ClientConfig {
    ClientConfig {
        crypto: Arc::new(plain::Provider::new(None, false)),
        local_identity: Identity::LocalHost,
        connection: ConnectionConfig {
            ip_allow_without_auth: 1,
            ..ConnectionConfig::default()
        },
    }
}

pub fn default_pair() -> Pair {
    Pair::new(server_config("server"))
}

pub fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

lazy_static! {
    pub static ref SERVER_PORTS: Mutex<RangeFrom<u16>> = Mutex::new(4433..);
    pub static ref CLIENT_PORTS: Mutex<RangeFrom<u16>> = Mutex::new(44433..);
}
