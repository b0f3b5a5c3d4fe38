//! Record-marking framing and the per-connection server codec.
//!
//! ONC RPC over stream transports splits each message into fragments, each
//! prefixed by a 4-byte header: the high bit marks the last fragment and the
//! low 31 bits carry the fragment length.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::message::{Call, MSG_CALL, MessageError, RPC_VERSION, Reply};
use crate::server::clients::Conn;
use crate::server::program::Dispatcher;
use crate::server::pruner::DisconnectNotifier;

const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Bytes a multiplexer must see to recognise a call: record mark, xid,
/// message type and RPC version.
pub const CALL_SIGNATURE_LEN: usize = 16;

/// Errors from the framing layer or from a malformed message.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("record of {size} bytes exceeds limit of {limit}")]
    RecordTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Returns true if `prefix` starts with the record mark and header of an
/// RPC version 2 call.
pub fn is_sunrpc_call(prefix: &[u8]) -> bool {
    if prefix.len() < CALL_SIGNATURE_LEN {
        return false;
    }
    let word = |i: usize| u32::from_be_bytes([prefix[i], prefix[i + 1], prefix[i + 2], prefix[i + 3]]);

    let fragment_len = word(0) & !LAST_FRAGMENT;
    fragment_len > 0 && word(8) == MSG_CALL && word(12) == RPC_VERSION
}

/// Tokio codec for record-marked messages.
#[derive(Debug)]
pub struct RecordCodec {
    max_record: usize,
    partial: BytesMut,
}

impl RecordCodec {
    pub fn new(max_record: usize) -> Self {
        Self {
            max_record,
            partial: BytesMut::new(),
        }
    }
}

impl Decoder for RecordCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }

            let mark = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            let last = mark & LAST_FRAGMENT != 0;
            let len = (mark & !LAST_FRAGMENT) as usize;

            let size = self.partial.len() + len;
            if size > self.max_record {
                return Err(CodecError::RecordTooLarge {
                    size,
                    limit: self.max_record,
                });
            }

            if src.len() < 4 + len {
                src.reserve(4 + len - src.len());
                return Ok(None);
            }

            src.advance(4);
            let fragment = src.split_to(len);

            if last && self.partial.is_empty() {
                return Ok(Some(fragment.freeze()));
            }
            self.partial.extend_from_slice(&fragment);
            if last {
                return Ok(Some(self.partial.split().freeze()));
            }
        }
    }
}

impl Encoder<Bytes> for RecordCodec {
    type Error = CodecError;

    fn encode(&mut self, record: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        if record.len() > self.max_record {
            return Err(CodecError::RecordTooLarge {
                size: record.len(),
                limit: self.max_record,
            });
        }
        dst.reserve(4 + record.len());
        dst.put_u32(LAST_FRAGMENT | record.len() as u32);
        dst.put_slice(&record);
        Ok(())
    }
}

/// Any bidirectional byte stream a listener can hand out.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

struct CloseState {
    closed: AtomicBool,
    token: CancellationToken,
    conn: Conn,
    notifier: DisconnectNotifier,
}

/// Cloneable handle that closes a [`ServerCodec`].
#[derive(Clone)]
pub struct CodecCloser {
    state: Arc<CloseState>,
}

impl CodecCloser {
    /// Close the codec and publish the connection as disconnected.
    ///
    /// Only the first call has any effect; it returns true; later calls
    /// return false.
    pub fn close(&self) -> bool {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.state.token.cancel();
        self.state.notifier.publish(self.state.conn.clone());
        true
    }
}

/// Serves RPC calls arriving on one connection.
///
/// The connection is reported on the disconnect channel exactly once: by the
/// first explicit [`CodecCloser::close`], or when the codec is dropped.
pub struct ServerCodec {
    framed: Framed<BoxedStream, RecordCodec>,
    closer: CodecCloser,
}

impl ServerCodec {
    pub fn new(
        stream: BoxedStream,
        conn: Conn,
        notifier: DisconnectNotifier,
        max_record: usize,
    ) -> Self {
        Self {
            framed: Framed::new(stream, RecordCodec::new(max_record)),
            closer: CodecCloser {
                state: Arc::new(CloseState {
                    closed: AtomicBool::new(false),
                    token: CancellationToken::new(),
                    conn,
                    notifier,
                }),
            },
        }
    }

    pub fn closer(&self) -> CodecCloser {
        self.closer.clone()
    }

    /// Read calls, dispatch them one at a time and write the replies until
    /// the peer hangs up, a protocol error occurs, or the codec is closed.
    pub async fn serve(mut self, dispatcher: &Dispatcher) -> Result<(), CodecError> {
        let token = self.closer.state.token.clone();

        loop {
            let record = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                next = self.framed.next() => match next {
                    Some(record) => record?,
                    None => return Ok(()),
                },
            };

            let reply = match Call::decode(record) {
                Ok(call) => dispatcher.dispatch(call).await,
                Err(MessageError::RpcVersion { xid, version }) => {
                    debug!(xid, version, "Rejecting call with unsupported RPC version");
                    Reply::rpc_mismatch(xid)
                }
                Err(e) => return Err(e.into()),
            };

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                sent = self.framed.send(reply.encode()) => sent?,
            }
        }
    }
}

impl Drop for ServerCodec {
    fn drop(&mut self) {
        self.closer.close();
    }
}
