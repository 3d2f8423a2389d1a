//! NATS client protocol codec.
//!
//! Covers the subset a probe needs: `CONNECT`, `PUB`, `SUB`, `UNSUB` and
//! `PING`/`PONG` going out, and `INFO`, `MSG`, `PING`, `PONG`, `+OK` and
//! `-ERR` coming back. Every operation is a CRLF-terminated control line;
//! `PUB` and `MSG` are followed by a payload block and another CRLF.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const CRLF: &[u8] = b"\r\n";
pub const DEFAULT_PORT: u16 = 4222;
// Servers default to 1 MiB unless INFO says otherwise.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
const MAX_CONTROL_LINE: usize = 4096;

/// Server greeting sent as the first operation on every connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub proto: u8,
    #[serde(default)]
    pub max_payload: Option<usize>,
}

impl ServerInfo {
    pub fn max_payload(&self) -> usize {
        self.max_payload.unwrap_or(DEFAULT_MAX_PAYLOAD)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
}

impl ConnectOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            echo: true,
        }
    }
}

/// Operations sent by the client.
///
/// ```
/// use bytes::BytesMut;
/// use transit_wire::nats::ClientOp;
///
/// let mut buf = BytesMut::new();
/// ClientOp::Pub { subject: "probe", payload: b"0" }
///     .encode_into(&mut buf)
///     .expect("encode");
/// assert_eq!(&buf[..], b"PUB probe 1\r\n0\r\n");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOp<'a> {
    Connect(&'a ConnectOptions),
    Pub { subject: &'a str, payload: &'a [u8] },
    Sub { subject: &'a str, sid: u64 },
    Unsub { sid: u64 },
    Ping,
    Pong,
}

impl ClientOp<'_> {
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            ClientOp::Connect(options) => {
                let json = serde_json::to_string(options)
                    .map_err(|err| Error::Protocol(format!("encode CONNECT: {err}")))?;
                buf.reserve(json.len() + 10);
                buf.put_slice(b"CONNECT ");
                buf.put_slice(json.as_bytes());
            }
            ClientOp::Pub { subject, payload } => {
                validate_subject(subject)?;
                let header = format!("PUB {subject} {}\r\n", payload.len());
                buf.reserve(header.len() + payload.len() + CRLF.len());
                buf.put_slice(header.as_bytes());
                buf.put_slice(payload);
            }
            ClientOp::Sub { subject, sid } => {
                validate_subject(subject)?;
                buf.put_slice(format!("SUB {subject} {sid}").as_bytes());
            }
            ClientOp::Unsub { sid } => buf.put_slice(format!("UNSUB {sid}").as_bytes()),
            ClientOp::Ping => buf.put_slice(b"PING"),
            ClientOp::Pong => buf.put_slice(b"PONG"),
        }
        buf.put_slice(CRLF);
        Ok(())
    }
}

/// Operations received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerOp {
    Info(ServerInfo),
    Msg {
        subject: String,
        sid: u64,
        reply_to: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Decodes one server operation from the front of `buf`, accepting `MSG`
/// payloads up to [`DEFAULT_MAX_PAYLOAD`].
///
/// Returns `Ok(None)` and leaves `buf` untouched when the operation is not
/// complete yet; the caller reads more bytes and tries again.
pub fn decode_server_op(buf: &mut BytesMut) -> Result<Option<ServerOp>> {
    decode_server_op_limited(buf, DEFAULT_MAX_PAYLOAD)
}

/// Like [`decode_server_op`], rejecting a `MSG` whose declared size exceeds
/// `max_payload` before any of its payload is buffered.
pub fn decode_server_op_limited(
    buf: &mut BytesMut,
    max_payload: usize,
) -> Result<Option<ServerOp>> {
    let Some(line_end) = find_crlf(buf) else {
        if buf.len() > MAX_CONTROL_LINE {
            return Err(Error::Protocol("control line too long".to_string()));
        }
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| Error::Protocol("control line is not utf-8".to_string()))?;
    let (verb, rest) = match line.split_once([' ', '\t']) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let op = match verb.to_ascii_uppercase().as_str() {
        "MSG" => {
            let args: Vec<&str> = rest.split_ascii_whitespace().collect();
            let (subject, sid, reply_to, len) = match args.as_slice() {
                [subject, sid, len] => (*subject, *sid, None, *len),
                [subject, sid, reply_to, len] => (*subject, *sid, Some(*reply_to), *len),
                _ => return Err(Error::Protocol(format!("bad MSG arguments: {rest}"))),
            };
            let sid = sid
                .parse::<u64>()
                .map_err(|_| Error::Protocol(format!("bad MSG sid: {sid}")))?;
            let len = len
                .parse::<usize>()
                .map_err(|_| Error::Protocol(format!("bad MSG size: {len}")))?;
            if len > max_payload {
                return Err(Error::PayloadTooLarge {
                    size: len,
                    max: max_payload,
                });
            }
            let payload_start = line_end + CRLF.len();
            let total = payload_start
                .checked_add(len)
                .and_then(|end| end.checked_add(CRLF.len()))
                .ok_or_else(|| Error::Protocol(format!("MSG size overflows: {len}")))?;
            if buf.len() < total {
                return Ok(None);
            }
            if &buf[payload_start + len..total] != CRLF {
                return Err(Error::Protocol("MSG payload not terminated".to_string()));
            }
            let subject = subject.to_string();
            let reply_to = reply_to.map(str::to_string);
            buf.advance(payload_start);
            let payload = buf.split_to(len).freeze();
            buf.advance(CRLF.len());
            return Ok(Some(ServerOp::Msg {
                subject,
                sid,
                reply_to,
                payload,
            }));
        }
        "INFO" => {
            let info = serde_json::from_str::<ServerInfo>(rest)
                .map_err(|err| Error::Protocol(format!("bad INFO: {err}")))?;
            ServerOp::Info(info)
        }
        "PING" => ServerOp::Ping,
        "PONG" => ServerOp::Pong,
        "+OK" => ServerOp::Ok,
        "-ERR" => ServerOp::Err(rest.trim_matches('\'').to_string()),
        _ => return Err(Error::Protocol(format!("unknown operation: {verb}"))),
    };
    buf.advance(line_end + CRLF.len());
    Ok(Some(op))
}

pub fn validate_subject(subject: &str) -> Result<()> {
    let invalid = subject.is_empty()
        || subject.starts_with('.')
        || subject.ends_with('.')
        || subject.contains("..")
        || subject.chars().any(|c| c.is_whitespace() || c.is_control());
    if invalid {
        return Err(Error::InvalidSubject(subject.to_string()));
    }
    Ok(())
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(CRLF.len()).position(|window| window == CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_msg_waits_for_payload() {
        let mut buf = BytesMut::from(&b"MSG probe 1 16\r\n17000000"[..]);
        assert_eq!(decode_server_op(&mut buf).expect("decode"), None);
        assert_eq!(buf.len(), 24);
        buf.extend_from_slice(b"00000000\r\n");
        let op = decode_server_op(&mut buf).expect("decode").expect("op");
        assert_eq!(
            op,
            ServerOp::Msg {
                subject: "probe".to_string(),
                sid: 1,
                reply_to: None,
                payload: Bytes::from_static(b"1700000000000000"),
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn unterminated_payload_is_rejected() {
        let mut buf = BytesMut::from(&b"MSG probe 1 1\r\n0XX"[..]);
        assert!(decode_server_op(&mut buf).is_err());
    }

    #[test]
    fn overlong_control_line_is_rejected() {
        let mut buf = BytesMut::from(vec![b'A'; MAX_CONTROL_LINE + 1].as_slice());
        assert!(decode_server_op(&mut buf).is_err());
    }

    #[test]
    fn subjects_are_validated() {
        assert!(validate_subject("topic007").is_ok());
        assert!(validate_subject("probe.latency").is_ok());
        for bad in ["", "a b", ".a", "a.", "a..b", "a\tb"] {
            assert!(validate_subject(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn connect_omits_missing_name() {
        let mut buf = BytesMut::new();
        ClientOp::Connect(&ConnectOptions::default())
            .encode_into(&mut buf)
            .expect("encode");
        let line = std::str::from_utf8(&buf).expect("utf8");
        assert!(line.starts_with("CONNECT {"));
        assert!(line.ends_with("}\r\n"));
        assert!(!line.contains("\"name\""));
        assert!(line.contains("\"verbose\":false"));
    }
}
