//! NATS transport.
//!
//! A [`NatsClient`] owns one TCP connection driven by a background actor. The
//! actor answers server `PING`s, routes `MSG`s to subscriptions and confirms
//! each publish or subscribe with a `PING`/`PONG` round trip, so a returned
//! `Ok` means the server has processed the operation.
mod connection;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use transit_wire::nats::{
    ClientOp, ConnectOptions, DEFAULT_PORT, ServerInfo, ServerOp, decode_server_op,
};

use crate::transport::{
    Delivery, Publish, Result, StartPosition, Subscribe, Subscription, TransportError,
};
use connection::{Command, Connection};

const COMMAND_QUEUE_DEPTH: usize = 256;
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Reported to the server in `CONNECT` so operators can spot the probe.
    pub name: Option<String>,
    pub connect_timeout: Duration,
    pub flush_timeout: Duration,
    /// Deliveries buffered per subscription before new messages are dropped.
    pub subscription_capacity: usize,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            name: None,
            connect_timeout: Duration::from_secs(5),
            flush_timeout: Duration::from_secs(5),
            subscription_capacity: 1024,
        }
    }
}

/// Normalizes a server address to `host:port`.
///
/// Accepts bare hosts, `host:port` and `nats://`/`tcp://` URLs.
pub fn parse_address(server: &str) -> Result<String> {
    let trimmed = server.trim();
    let rest = trimmed
        .strip_prefix("nats://")
        .or_else(|| trimmed.strip_prefix("tcp://"))
        .unwrap_or(trimmed)
        .trim_end_matches('/');
    if rest.is_empty() || rest.contains("://") || rest.contains(char::is_whitespace) {
        return Err(TransportError::InvalidAddress(server.to_string()));
    }
    // Bracketed IPv6 literals carry their own colons.
    let bracketed = rest.starts_with('[') && rest.ends_with(']');
    let has_port = match rest.rsplit_once(':') {
        Some(_) if bracketed => false,
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => true,
        Some(_) => return Err(TransportError::InvalidAddress(server.to_string())),
        None => false,
    };
    if has_port {
        Ok(rest.to_string())
    } else {
        Ok(format!("{rest}:{DEFAULT_PORT}"))
    }
}

/// Handle to a NATS connection. Clones share the connection.
#[derive(Clone)]
pub struct NatsClient {
    commands: mpsc::Sender<Command>,
    info: Arc<ServerInfo>,
    config: NatsConfig,
    next_sid: Arc<AtomicU64>,
}

impl NatsClient {
    /// Connects to the first reachable server of `servers`.
    pub async fn connect(servers: &[String], config: NatsConfig) -> Result<Self> {
        let mut last_error = None;
        for server in servers {
            match Self::connect_one(server, &config).await {
                Ok(client) => return Ok(client),
                Err(err) => {
                    tracing::warn!(server = %server, error = %err, "nats connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::InvalidAddress(String::new())))
    }

    async fn connect_one(server: &str, config: &NatsConfig) -> Result<Self> {
        let addr = parse_address(server)?;
        let stream = timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout("connect"))?
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let options = match &config.name {
            Some(name) => ConnectOptions::named(name.clone()),
            None => ConnectOptions::default(),
        };
        let (stream, info, leftover) =
            timeout(config.connect_timeout, handshake(stream, &options))
                .await
                .map_err(|_| TransportError::Timeout("handshake"))??;
        tracing::info!(
            addr = %addr,
            server_id = %info.server_id,
            version = %info.version,
            "connected to nats"
        );

        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let connection = Connection::new(stream, leftover, info.max_payload());
        tokio::spawn(connection.run(receiver));
        Ok(Self {
            commands,
            info: Arc::new(info),
            config: config.clone(),
            next_sid: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    // Sends a command and waits for the server to confirm it.
    async fn confirm(
        &self,
        what: &'static str,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (response, confirmed) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(command(response))
                .await
                .map_err(|_| TransportError::Closed)?;
            confirmed.await.map_err(|_| TransportError::Closed)?
        };
        timeout(self.config.flush_timeout, exchange)
            .await
            .map_err(|_| TransportError::Timeout(what))?
    }
}

// INFO, then CONNECT + PING, then wait for the PONG that proves CONNECT was
// accepted. Bytes read past the PONG are handed to the connection actor.
async fn handshake(
    mut stream: TcpStream,
    options: &ConnectOptions,
) -> Result<(TcpStream, ServerInfo, BytesMut)> {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let info = match read_op(&mut stream, &mut buf).await? {
        ServerOp::Info(info) => info,
        ServerOp::Err(message) => return Err(TransportError::Server(message)),
        other => {
            return Err(TransportError::Server(format!(
                "expected INFO, got {other:?}"
            )));
        }
    };

    let mut out = BytesMut::new();
    ClientOp::Connect(options).encode_into(&mut out)?;
    ClientOp::Ping.encode_into(&mut out)?;
    stream.write_all(&out).await?;

    loop {
        match read_op(&mut stream, &mut buf).await? {
            ServerOp::Pong => return Ok((stream, info, buf)),
            ServerOp::Ping => {
                out.clear();
                ClientOp::Pong.encode_into(&mut out)?;
                stream.write_all(&out).await?;
            }
            ServerOp::Err(message) => return Err(TransportError::Server(message)),
            ServerOp::Ok | ServerOp::Info(_) | ServerOp::Msg { .. } => {}
        }
    }
}

async fn read_op(stream: &mut TcpStream, buf: &mut BytesMut) -> Result<ServerOp> {
    loop {
        if let Some(op) = decode_server_op(buf)? {
            return Ok(op);
        }
        buf.reserve(READ_CHUNK);
        if stream.read_buf(buf).await? == 0 {
            return Err(TransportError::Closed);
        }
    }
}

#[async_trait]
impl Publish for NatsClient {
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        let subject = topic.to_string();
        self.confirm("publish flush", move |response| Command::Publish {
            subject,
            payload,
            response,
        })
        .await
    }
}

#[async_trait]
impl Subscribe for NatsClient {
    async fn subscribe(
        &mut self,
        topic: &str,
        start: StartPosition,
    ) -> Result<Box<dyn Subscription>> {
        if start != StartPosition::Newest {
            return Err(TransportError::Unsupported(format!(
                "nats subscriptions start at the newest message, not {start}"
            )));
        }
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (deliveries, receiver) = mpsc::channel(self.config.subscription_capacity.max(1));
        let subject = topic.to_string();
        self.confirm("subscribe flush", move |response| Command::Subscribe {
            subject,
            sid,
            deliveries,
            response,
        })
        .await?;
        tracing::debug!(topic, sid, "nats subscription opened");
        Ok(Box::new(NatsSubscription {
            sid,
            receiver,
            commands: self.commands.clone(),
        }))
    }
}

struct NatsSubscription {
    sid: u64,
    receiver: mpsc::Receiver<Result<Delivery>>,
    commands: mpsc::Sender<Command>,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        self.receiver.recv().await
    }
}

impl Drop for NatsSubscription {
    fn drop(&mut self) {
        // Best effort; the actor also unsubscribes when it sees the receiver gone.
        let _ = self.commands.try_send(Command::Unsubscribe { sid: self.sid });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_normalized() {
        let cases = [
            ("localhost", "localhost:4222"),
            ("nats://localhost", "localhost:4222"),
            ("tcp://10.0.0.1:5222", "10.0.0.1:5222"),
            ("nats://broker:4223/", "broker:4223"),
            (" 127.0.0.1:4222 ", "127.0.0.1:4222"),
            ("[::1]", "[::1]:4222"),
            ("[::1]:4300", "[::1]:4300"),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_address(input).expect(input), expected, "{input:?}");
        }
    }

    #[test]
    fn bad_addresses_are_rejected() {
        for input in ["", "nats://", "http://host", "host:port", "a b:4222", ":4222"] {
            assert!(
                matches!(parse_address(input), Err(TransportError::InvalidAddress(_))),
                "{input:?}"
            );
        }
    }

    #[tokio::test]
    async fn connect_without_servers_fails() {
        let err = NatsClient::connect(&[], NatsConfig::default())
            .await
            .err()
            .expect("no servers");
        assert!(matches!(err, TransportError::InvalidAddress(_)));
    }
}
