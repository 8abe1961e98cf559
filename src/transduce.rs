use std::{
    io,
    sync::{Arc, Mutex},
};

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::{
    intercept::Interceptors,
    parse::{MessageParser, ParseError, ParseEvent, Side},
};

/// Read size for the relay loops.
const IO_CHUNK_SIZE: usize = 32 * 1024;

/// Application protocol currently carried by a proxied connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Protocol {
    /// HTTP/1.x; messages are framed and intercepted.
    #[default]
    Http,
    /// Some upgraded protocol; bytes pass through untouched.
    Other(String),
}

/// Per-connection protocol cell shared by both directional transducers.
///
/// Starts as [`Protocol::Http`] and latches one-way to [`Protocol::Other`]
/// when the response side sees `101 Switching Protocols`; from then on
/// neither direction parses or buffers anything.
#[derive(Debug, Clone, Default)]
pub struct SharedProtocol(Arc<Mutex<Protocol>>);

impl SharedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_http(&self) -> bool {
        *self.0.lock().expect("poisoned") == Protocol::Http
    }

    pub fn current(&self) -> Protocol {
        self.0.lock().expect("poisoned").clone()
    }

    /// Latches the connection out of HTTP mode. A second latch keeps the
    /// first token.
    pub fn latch(&self, token: impl Into<String>) {
        let mut protocol = self.0.lock().expect("poisoned");
        if *protocol == Protocol::Http {
            *protocol = Protocol::Other(token.into());
        }
    }
}

/// One direction of a proxied connection: a byte stream that parses the HTTP
/// traffic it carries.
///
/// While a head is being framed its bytes accumulate and nothing is emitted;
/// when the head completes the side's interceptor pipeline runs and the
/// serialized replacement head is emitted in one piece, before any body byte.
/// Body bytes stream through directly. A `101` response latches the shared
/// protocol cell, switching both directions to opaque passthrough for the
/// rest of the connection.
#[derive(Debug)]
pub struct Transducer {
    side: Side,
    parser: MessageParser,
    interceptors: Arc<Interceptors>,
    protocol: SharedProtocol,
}

impl Transducer {
    pub fn new(side: Side, interceptors: Arc<Interceptors>, protocol: SharedProtocol) -> Self {
        Self {
            side,
            parser: MessageParser::new(side),
            interceptors,
            protocol,
        }
    }

    /// Transforms one input chunk into zero or more output chunks.
    ///
    /// On a parse error the not-yet-framed bytes are emitted as-is so the
    /// caller can forward them best-effort before tearing the connection
    /// down.
    pub fn push(&mut self, chunk: Bytes, out: &mut Vec<Bytes>) -> Result<(), ParseError> {
        if !self.protocol.is_http() {
            // Opaque mode. Release anything the parser was still holding,
            // then stop consulting it.
            let unframed = self.parser.take_unframed();
            if !unframed.is_empty() {
                out.push(unframed);
            }
            out.push(chunk);
            return Ok(());
        }
        let events = match self.parser.feed(&chunk) {
            Ok(events) => events,
            Err(err) => {
                let unframed = self.parser.take_unframed();
                if !unframed.is_empty() {
                    out.push(unframed);
                }
                return Err(err);
            }
        };
        for event in events {
            match event {
                ParseEvent::Headers(mut message) => {
                    self.interceptors.apply(self.side, &mut message);
                    if self.side == Side::Response
                        && message.status() == Some(StatusCode::SWITCHING_PROTOCOLS)
                    {
                        let token = message.upgrade_token().unwrap_or_else(|| "unknown".to_string());
                        debug!(%token, "101 response, latching connection to opaque mode");
                        self.protocol.latch(token);
                    }
                    out.push(message.encode_head());
                }
                ParseEvent::Body { offset, len } => {
                    out.push(chunk.slice(offset..offset + len));
                }
            }
        }
        Ok(())
    }

    /// Emits whatever input was received but never framed, as one tail chunk.
    /// Called at end of input so a half-closed stream loses no bytes.
    pub fn flush(&mut self, out: &mut Vec<Bytes>) {
        let unframed = self.parser.take_unframed();
        if !unframed.is_empty() {
            out.push(unframed);
        }
    }
}

/// Copies `reader` to `writer` through `transducer` until end of input.
/// Returns the number of bytes written.
pub(crate) async fn pump(
    reader: &mut (impl AsyncRead + Send + Unpin),
    writer: &mut (impl AsyncWrite + Send + Unpin),
    transducer: &mut Transducer,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut out = Vec::new();
    let mut buf = BytesMut::new();
    loop {
        buf.reserve(IO_CHUNK_SIZE);
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.clear();
        let result = transducer.push(buf.split().freeze(), &mut out);
        for part in &out {
            writer.write_all(part).await?;
            total += part.len() as u64;
        }
        if let Err(err) = result {
            return Err(io::Error::new(io::ErrorKind::InvalidData, err));
        }
    }
    out.clear();
    transducer.flush(&mut out);
    for part in &out {
        writer.write_all(part).await?;
        total += part.len() as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Bidirectionally relays a client/backend socket pair, each direction
/// running through its own transducer. Each side's writer is shut down when
/// the opposite reader reaches end of input, so half-closed flows drain
/// fully.
pub(crate) async fn relay(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    backend_recv: &mut (impl AsyncRead + Send + Unpin),
    backend_send: &mut (impl AsyncWrite + Send + Unpin),
    request: &mut Transducer,
    response: &mut Transducer,
) -> io::Result<(u64, u64)> {
    let (up, down) = tokio::join!(
        async {
            let res = pump(client_recv, backend_send, request).await;
            backend_send.shutdown().await.ok();
            trace!(?res, "client-to-backend finished");
            res
        },
        async {
            let res = pump(backend_recv, client_send, response).await;
            client_send.shutdown().await.ok();
            trace!(?res, "backend-to-client finished");
            res
        }
    );
    Ok((up?, down?))
}
