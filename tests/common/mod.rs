//! In-process MQTT 3.1.1 broker for integration tests
//!
//! Understands just enough of the protocol for one client per test:
//! CONNECT, SUBSCRIBE, PUBLISH (QoS 0), PINGREQ and DISCONNECT. Every packet
//! received is recorded; tests can push PUBLISH packets to connected clients
//! and drop connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

/// A packet received from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Connect { client_id: String },
    Subscribe { packet_id: u16, filters: Vec<String> },
    Publish { topic: String, payload: Bytes },
    PingReq,
    Disconnect,
}

struct Client {
    tx: mpsc::UnboundedSender<Bytes>,
    kill: Arc<Notify>,
}

#[derive(Default)]
struct State {
    received: Mutex<Vec<Received>>,
    clients: Mutex<Vec<Client>>,
    refuse_subscribe: bool,
    withhold_suback: bool,
}

pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<State>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self::with_state(State::default()).await
    }

    /// Broker answering every SUBSCRIBE with a failure return code
    pub async fn refusing_subscribe() -> Self {
        Self::with_state(State {
            refuse_subscribe: true,
            ..Default::default()
        })
        .await
    }

    /// Broker recording every SUBSCRIBE without ever acknowledging it
    pub async fn silent_on_subscribe() -> Self {
        Self::with_state(State {
            withhold_suback: true,
            ..Default::default()
        })
        .await
    }

    async fn with_state(state: State) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake broker");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(state);

        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    pub fn subscribes(&self) -> Vec<Vec<String>> {
        self.received()
            .into_iter()
            .filter_map(|p| match p {
                Received::Subscribe { filters, .. } => Some(filters),
                _ => None,
            })
            .collect()
    }

    pub fn publishes(&self) -> Vec<(String, Bytes)> {
        self.received()
            .into_iter()
            .filter_map(|p| match p {
                Received::Publish { topic, payload } => Some((topic, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.received()
            .iter()
            .filter(|p| matches!(p, Received::Connect { .. }))
            .count()
    }

    /// Send a QoS 0 PUBLISH to every connected client
    pub fn publish(&self, topic: &str, payload: &[u8]) {
        let mut body = BytesMut::new();
        put_str(&mut body, topic);
        body.put_slice(payload);
        let packet = frame(0x30, &body);

        for client in self.state.clients.lock().iter() {
            let _ = client.tx.send(packet.clone());
        }
    }

    /// Close every client connection
    pub fn drop_clients(&self) {
        for client in self.state.clients.lock().drain(..) {
            client.kill.notify_one();
        }
    }

    /// Poll until `check` holds, panicking after `limit`
    pub async fn wait_until<F>(&self, limit: Duration, mut check: F)
    where
        F: FnMut(&FakeBroker) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        while !check(self) {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met in {:?}; received {:?}", limit, self.received());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Address nothing is listening on
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("tcp://{}", addr)
}

async fn serve(stream: TcpStream, state: Arc<State>) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let write_task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if writer.write_all(&packet).await.is_err() {
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let kill = Arc::new(Notify::new());
    let mut registered = false;
    loop {
        let packet = tokio::select! {
            packet = read_packet(&mut reader) => packet,
            _ = kill.notified() => None,
        };
        let Some((header, body)) = packet else {
            break;
        };

        match header >> 4 {
            1 => {
                let client_id = connect_client_id(&body);
                state.received.lock().push(Received::Connect { client_id });
                let _ = tx.send(Bytes::from_static(&[0x20, 0x02, 0x00, 0x00]));
                if !registered {
                    state.clients.lock().push(Client {
                        tx: tx.clone(),
                        kill: kill.clone(),
                    });
                    registered = true;
                }
            }
            3 => {
                let (topic, payload) = parse_publish(header, &body);
                state.received.lock().push(Received::Publish { topic, payload });
            }
            8 => {
                let (packet_id, filters) = parse_subscribe(&body);
                let code = if state.refuse_subscribe { 0x80 } else { 0x00 };
                let mut ack = BytesMut::new();
                ack.put_u16(packet_id);
                for _ in &filters {
                    ack.put_u8(code);
                }
                state
                    .received
                    .lock()
                    .push(Received::Subscribe { packet_id, filters });
                if !state.withhold_suback {
                    let _ = tx.send(frame(0x90, &ack));
                }
            }
            12 => {
                state.received.lock().push(Received::PingReq);
                let _ = tx.send(Bytes::from_static(&[0xD0, 0x00]));
            }
            14 => {
                state.received.lock().push(Received::Disconnect);
                break;
            }
            _ => {}
        }
    }

    drop(tx);
    let _ = write_task.await;
}

async fn read_packet<R: AsyncReadExt + Unpin>(reader: &mut R) -> Option<(u8, Vec<u8>)> {
    let header = reader.read_u8().await.ok()?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await.ok()?;
        remaining |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return None;
        }
    }

    let mut body = vec![0u8; remaining];
    reader.read_exact(&mut body).await.ok()?;
    Some((header, body))
}

fn frame(header: u8, body: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(body.len() + 5);
    packet.put_u8(header);
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        packet.put_u8(byte);
        if len == 0 {
            break;
        }
    }
    packet.put_slice(body);
    packet.freeze()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn read_str(body: &[u8], pos: &mut usize) -> String {
    let len = u16::from_be_bytes([body[*pos], body[*pos + 1]]) as usize;
    let s = String::from_utf8_lossy(&body[*pos + 2..*pos + 2 + len]).to_string();
    *pos += 2 + len;
    s
}

fn connect_client_id(body: &[u8]) -> String {
    let mut pos = 0;
    let _protocol = read_str(body, &mut pos);
    // level, flags, keep alive
    pos += 4;
    read_str(body, &mut pos)
}

fn parse_publish(header: u8, body: &[u8]) -> (String, Bytes) {
    let mut pos = 0;
    let topic = read_str(body, &mut pos);
    if (header >> 1) & 0x03 > 0 {
        pos += 2;
    }
    (topic, Bytes::copy_from_slice(&body[pos..]))
}

fn parse_subscribe(body: &[u8]) -> (u16, Vec<String>) {
    let packet_id = u16::from_be_bytes([body[0], body[1]]);
    let mut pos = 2;
    let mut filters = Vec::new();
    while pos < body.len() {
        filters.push(read_str(body, &mut pos));
        // requested QoS
        pos += 1;
    }
    (packet_id, filters)
}
