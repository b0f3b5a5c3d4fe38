//! SunRPC over the shared TCP port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sunrpcd::programs::{dump, portmap};
use sunrpcd::rpc::message::{AcceptStat, ReplyBody};
use sunrpcd::rpc::{CALL_SIGNATURE_LEN, ClientError, RpcClient, is_sunrpc_call};
use sunrpcd::server::mux::{Mux, MuxListener};
use sunrpcd::{AppConfig, AppContext, SunRpc};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn start() -> (TempDir, Arc<Mux>, MuxListener, Arc<SunRpc>) {
    let dir = tempfile::tempdir().unwrap();
    let ctx = AppContext::new(AppConfig {
        rundir: dir.path().to_path_buf(),
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        match_timeout_ms: 2000,
        ..AppConfig::default()
    });

    let mux = Arc::new(
        Mux::bind(ctx.config.listen_addr, ctx.config.match_timeout())
            .await
            .unwrap(),
    );
    let rpc = mux.matcher(CALL_SIGNATURE_LEN, is_sunrpc_call);
    let http = mux.matcher(4, |b| b.starts_with(b"GET "));
    tokio::spawn({
        let mux = mux.clone();
        async move { mux.serve().await }
    });

    let server = Arc::new(SunRpc::new(&ctx, rpc).unwrap());
    tokio::spawn({
        let server = server.clone();
        async move { server.serve().await }
    });

    (dir, mux, http, server)
}

#[tokio::test]
async fn test_rpc_over_shared_port() {
    let (_dir, mux, _http, server) = start().await;

    let mut client = RpcClient::connect_tcp(mux.local_addr()).await.unwrap();
    let reply = dump::query(&mut client, 3).await.unwrap();
    assert_eq!(reply.programs.len(), 3);

    let err = client
        .call(portmap::PROGRAM, portmap::VERSION, 99, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Rejected(ReplyBody::Accepted(AcceptStat::ProcUnavail))
    ));

    let err = client
        .call(portmap::PROGRAM, 7, 0, Bytes::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Rejected(ReplyBody::Accepted(AcceptStat::ProgMismatch { low: 1, high: 1 }))
    ));

    assert_eq!(server.clients().connected(), 1);
    server.stop();
    mux.close();
}

#[tokio::test]
async fn test_other_protocols_go_elsewhere() {
    let (_dir, mux, mut http, server) = start().await;

    let mut browser = TcpStream::connect(mux.local_addr()).await.unwrap();
    browser.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    assert!(
        timeout(Duration::from_secs(2), http.accept())
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(server.clients().connected(), 0);

    // Nothing claims this one, so the multiplexer hangs up.
    let mut stranger = TcpStream::connect(mux.local_addr()).await.unwrap();
    stranger.write_all(b"\x16\x03\x01\x02\x00\x01\x00\x01\xfc\x03\x03\x00\x00\x00\x00\x00").await.unwrap();
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(3), stranger.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server.clients().connected(), 0);

    server.stop();
    mux.close();
}

#[tokio::test]
async fn test_stop_closes_tcp_sessions() {
    let (_dir, mux, _http, server) = start().await;

    let mut client = RpcClient::connect_tcp(mux.local_addr()).await.unwrap();
    dump::query(&mut client, 1).await.unwrap();

    server.stop();
    timeout(Duration::from_secs(2), server.drain()).await.unwrap();

    let err = dump::query(&mut client, 2).await.unwrap_err();
    assert!(matches!(err, ClientError::Closed | ClientError::Codec(_)));
    mux.close();
}
