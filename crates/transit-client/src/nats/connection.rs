// Connection actor: the only owner of the NATS socket.
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use transit_wire::nats::{ClientOp, ServerOp, decode_server_op_limited, validate_subject};

use crate::transport::{Delivery, Result, TransportError};

const READ_CHUNK: usize = 16 * 1024;

pub(crate) enum Command {
    Publish {
        subject: String,
        payload: Bytes,
        response: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        subject: String,
        sid: u64,
        deliveries: mpsc::Sender<Result<Delivery>>,
        response: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        sid: u64,
    },
}

// A PING sent on behalf of a caller. The server handles operations in order,
// so any -ERR it reports before the matching PONG belongs to this caller.
struct PendingFlush {
    response: oneshot::Sender<Result<()>>,
    error: Option<String>,
}

struct SubscriptionSlot {
    subject: String,
    deliveries: mpsc::Sender<Result<Delivery>>,
    sequence: u64,
    dropped: u64,
}

pub(crate) struct Connection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_payload: usize,
    pending: VecDeque<PendingFlush>,
    subscriptions: HashMap<u64, SubscriptionSlot>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, read_buf: BytesMut, max_payload: usize) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader,
            writer,
            read_buf,
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            max_payload,
            pending: VecDeque::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        // The handshake may have read operations past its PONG.
        let outcome = match self.drain_inbound().await {
            Ok(()) => self.serve(&mut commands).await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => tracing::debug!("nats connection closed by client"),
            Err(err) => {
                tracing::warn!(error = %err, "nats connection lost");
                metrics::counter!("transit_transport_disconnects_total").increment(1);
            }
        }
        self.shutdown();
    }

    async fn serve(&mut self, commands: &mut mpsc::Receiver<Command>) -> Result<()> {
        loop {
            self.read_buf.reserve(READ_CHUNK);
            tokio::select! {
                read = self.reader.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        return Err(TransportError::Closed);
                    }
                    self.drain_inbound().await?;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    async fn drain_inbound(&mut self) -> Result<()> {
        while let Some(op) = decode_server_op_limited(&mut self.read_buf, self.max_payload)? {
            match op {
                ServerOp::Msg {
                    subject,
                    sid,
                    payload,
                    ..
                } => self.route(&subject, sid, payload).await?,
                ServerOp::Ping => self.write(&[ClientOp::Pong]).await?,
                ServerOp::Pong => {
                    if let Some(flush) = self.pending.pop_front() {
                        let result = match flush.error {
                            Some(message) => Err(TransportError::Server(message)),
                            None => Ok(()),
                        };
                        let _ = flush.response.send(result);
                    }
                }
                ServerOp::Err(message) => self.server_error(message),
                ServerOp::Info(info) => {
                    // Servers may push INFO again, e.g. on cluster changes.
                    self.max_payload = info.max_payload();
                }
                ServerOp::Ok => {}
            }
        }
        Ok(())
    }

    async fn route(&mut self, subject: &str, sid: u64, payload: Bytes) -> Result<()> {
        let Some(slot) = self.subscriptions.get_mut(&sid) else {
            tracing::trace!(subject, sid, "message for unknown subscription");
            return Ok(());
        };
        let delivery = Delivery {
            payload,
            position: slot.sequence,
        };
        slot.sequence += 1;
        match slot.deliveries.try_send(Ok(delivery)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                slot.dropped += 1;
                metrics::counter!("transit_transport_dropped_total").increment(1);
                if slot.dropped.is_power_of_two() {
                    tracing::warn!(
                        subject = %slot.subject,
                        sid,
                        dropped = slot.dropped,
                        "subscription queue full, dropping messages"
                    );
                }
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                self.subscriptions.remove(&sid);
                self.write(&[ClientOp::Unsub { sid }]).await
            }
        }
    }

    fn server_error(&mut self, message: String) {
        tracing::warn!(error = %message, "nats server reported an error");
        if let Some(flush) = self.pending.iter_mut().find(|flush| flush.error.is_none()) {
            flush.error = Some(message.clone());
        }
        for slot in self.subscriptions.values() {
            let _ = slot
                .deliveries
                .try_send(Err(TransportError::Server(message.clone())));
        }
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Publish {
                subject,
                payload,
                response,
            } => {
                if payload.len() > self.max_payload {
                    let _ = response.send(Err(transit_wire::Error::PayloadTooLarge {
                        size: payload.len(),
                        max: self.max_payload,
                    }
                    .into()));
                    return Ok(());
                }
                let op = ClientOp::Pub {
                    subject: &subject,
                    payload: &payload,
                };
                self.flush_after(&op, response).await
            }
            Command::Subscribe {
                subject,
                sid,
                deliveries,
                response,
            } => {
                if let Err(err) = validate_subject(&subject) {
                    let _ = response.send(Err(err.into()));
                    return Ok(());
                }
                let op = ClientOp::Sub {
                    subject: &subject,
                    sid,
                };
                self.flush_after(&op, response).await?;
                self.subscriptions.insert(
                    sid,
                    SubscriptionSlot {
                        subject,
                        deliveries,
                        sequence: 0,
                        dropped: 0,
                    },
                );
                Ok(())
            }
            Command::Unsubscribe { sid } => {
                if self.subscriptions.remove(&sid).is_some() {
                    self.write(&[ClientOp::Unsub { sid }]).await?;
                }
                Ok(())
            }
        }
    }

    // Writes `op` followed by a PING; the caller is answered on the PONG.
    // Encoding errors go back to the caller and leave the connection usable.
    async fn flush_after(
        &mut self,
        op: &ClientOp<'_>,
        response: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        self.write_buf.clear();
        if let Err(err) = op.encode_into(&mut self.write_buf) {
            let _ = response.send(Err(err.into()));
            return Ok(());
        }
        ClientOp::Ping.encode_into(&mut self.write_buf)?;
        self.pending.push_back(PendingFlush {
            response,
            error: None,
        });
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    async fn write(&mut self, ops: &[ClientOp<'_>]) -> Result<()> {
        self.write_buf.clear();
        for op in ops {
            op.encode_into(&mut self.write_buf)?;
        }
        self.writer.write_all(&self.write_buf).await?;
        Ok(())
    }

    fn shutdown(&mut self) {
        for flush in self.pending.drain(..) {
            let _ = flush.response.send(Err(TransportError::Closed));
        }
        for (_, slot) in self.subscriptions.drain() {
            let _ = slot.deliveries.try_send(Err(TransportError::Closed));
        }
    }
}
