//! RPC client for talking to a running server.
//!
//! Used by the `status` command and by the integration tests. One call is
//! in flight at a time; replies are matched to calls by xid.

use std::io;
use std::net::SocketAddr;
use std::path::Path;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;

use super::codec::{BoxedStream, CodecError, RecordCodec};
use super::message::{AcceptStat, Call, CallHeader, MessageError, OpaqueAuth, Reply, ReplyBody};
use super::xdr::XdrError;

/// Largest record the client accepts.
const MAX_RECORD: usize = 4 * 1024 * 1024;

pub struct RpcClient {
    framed: Framed<BoxedStream, RecordCodec>,
    next_xid: u32,
}

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to server: {0}")]
    Connect(#[source] io::Error),

    #[error("communication error: {0}")]
    Codec(#[from] CodecError),

    #[error("bad reply: {0}")]
    Message(#[from] MessageError),

    #[error("cannot decode results: {0}")]
    Xdr(#[from] XdrError),

    #[error("connection closed before a reply arrived")]
    Closed,

    #[error("reply xid {got:#x} does not match call xid {expected:#x}")]
    XidMismatch { expected: u32, got: u32 },

    #[error("call not completed: {0:?}")]
    Rejected(ReplyBody),
}

impl RpcClient {
    pub async fn connect_unix(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await.map_err(ClientError::Connect)?;
        Ok(Self::from_stream(Box::new(stream)))
    }

    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        Ok(Self::from_stream(Box::new(stream)))
    }

    pub fn from_stream(stream: BoxedStream) -> Self {
        Self {
            framed: Framed::new(stream, RecordCodec::new(MAX_RECORD)),
            next_xid: 1,
        }
    }

    /// Call `proc` and return its XDR-encoded results. Anything other than
    /// a successful reply is an error.
    pub async fn call(
        &mut self,
        prog: u32,
        vers: u32,
        proc: u32,
        args: Bytes,
    ) -> Result<Bytes, ClientError> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);

        let call = Call {
            header: CallHeader {
                xid,
                prog,
                vers,
                proc,
                cred: OpaqueAuth::none(),
                verf: OpaqueAuth::none(),
            },
            args,
        };

        let reply = self.call_raw(call).await?;
        match reply.body {
            ReplyBody::Accepted(AcceptStat::Success(results)) => Ok(results),
            body => Err(ClientError::Rejected(body)),
        }
    }

    /// Send a prebuilt call and return whatever reply comes back.
    pub async fn call_raw(&mut self, call: Call) -> Result<Reply, ClientError> {
        let xid = call.header.xid;
        self.send_record(call.encode()).await?;

        let reply = Reply::decode(self.recv_record().await?)?;
        if reply.xid != xid {
            return Err(ClientError::XidMismatch {
                expected: xid,
                got: reply.xid,
            });
        }
        Ok(reply)
    }

    /// Write one raw record, bypassing call encoding.
    pub async fn send_record(&mut self, record: Bytes) -> Result<(), ClientError> {
        self.framed.send(record).await?;
        Ok(())
    }

    pub async fn recv_record(&mut self) -> Result<Bytes, ClientError> {
        match self.framed.next().await {
            Some(record) => Ok(record?),
            None => Err(ClientError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::xdr::{XdrReader, XdrWriter};

    #[tokio::test]
    async fn test_call_round_trips_through_peer() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let mut client = RpcClient::from_stream(Box::new(client_side));

        let server = tokio::spawn(async move {
            let mut framed = Framed::new(server_side, RecordCodec::new(MAX_RECORD));
            let record = framed.next().await.unwrap().unwrap();
            let call = Call::decode(record).unwrap();
            assert_eq!((call.header.prog, call.header.vers, call.header.proc), (9, 1, 3));

            let mut w = XdrWriter::new();
            w.put_u32(XdrReader::new(call.args).get_u32().unwrap() * 2);
            framed
                .send(Reply::success(call.header.xid, w.finish()).encode())
                .await
                .unwrap();
        });

        let mut args = XdrWriter::new();
        args.put_u32(21);
        let results = client.call(9, 1, 3, args.finish()).await.unwrap();
        assert_eq!(XdrReader::new(results).get_u32().unwrap(), 42);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_reply_is_rejected() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let mut client = RpcClient::from_stream(Box::new(client_side));

        tokio::spawn(async move {
            let mut framed = Framed::new(server_side, RecordCodec::new(MAX_RECORD));
            let call = Call::decode(framed.next().await.unwrap().unwrap()).unwrap();
            framed
                .send(Reply::accepted(call.header.xid, AcceptStat::ProcUnavail).encode())
                .await
                .unwrap();
        });

        let err = client.call(9, 1, 77, Bytes::new()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Rejected(ReplyBody::Accepted(AcceptStat::ProcUnavail))
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup_is_closed() {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let mut client = RpcClient::from_stream(Box::new(client_side));
        drop(server_side);

        let err = client.call(9, 1, 0, Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::Closed | ClientError::Codec(_)));
    }
}
