
use std::time::Duration;

use harness::{MySqlUpstream, ProxyHandle};
use plfm_mysql_wire::InitialHandshakePacket;
use plfm_sql_proxy::UpstreamTarget;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const IO_TIMEOUT: Duration = Duration::from_secs(2);

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    buf
}

async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let _ = timeout(IO_TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("peer never closed");
    buf
}

#[tokio::test]
async fn handshake_is_mirrored_byte_for_byte() {
    let upstream = MySqlUpstream::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(ProxyHandle::config(upstream.target())).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let greeting = read_exactly(&mut client, upstream.greeting.len()).await;
    assert_eq!(greeting, upstream.greeting);

    let packet = InitialHandshakePacket::decode(&greeting).unwrap();
    assert_eq!(packet.server_version_str(), "5.7");
    assert_eq!(packet.connection_id, 42);
    assert_eq!(packet.auth_plugin_name_str(), "mysql_native_password");

    client.write_all(b"\x01\x00\x00\x01\x01").await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"\x01\x00\x00\x01\x01");

    drop(client);
    assert!(proxy.wait_for_metrics(|s| s.connections_open == 0).await);
    proxy.shutdown().await;
}

#[tokio::test]
async fn byte_counters_match_traffic_when_decoding_disabled() {
    let upstream = MySqlUpstream::spawn().await.unwrap();
    let mut config = ProxyHandle::config(upstream.target());
    config.decode_handshake = false;
    let proxy = ProxyHandle::spawn(config).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let greeting = read_exactly(&mut client, upstream.greeting.len()).await;
    assert_eq!(greeting, upstream.greeting);

    let query = vec![0x5au8; 3000];
    client.write_all(&query).await.unwrap();
    let echoed = read_exactly(&mut client, query.len()).await;
    assert_eq!(echoed, query);

    client.shutdown().await.unwrap();
    assert!(read_until_closed(&mut client).await.is_empty());

    assert!(
        proxy
            .wait_for_metrics(|s| s.connections_total == 1 && s.connections_open == 0)
            .await
    );
    let s = proxy.metrics.snapshot();
    assert_eq!(s.bytes_from_client, query.len() as u64);
    assert_eq!(s.bytes_to_client, (upstream.greeting.len() + query.len()) as u64);
    assert_eq!(s.errors_total, 0);
    assert!(s.last_request_latency_seconds > 0.0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn mirrored_greeting_is_not_counted_as_relayed_bytes() {
    let upstream = MySqlUpstream::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(ProxyHandle::config(upstream.target())).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    read_exactly(&mut client, upstream.greeting.len()).await;

    client.write_all(b"ping").await.unwrap();
    read_exactly(&mut client, 4).await;
    client.shutdown().await.unwrap();
    read_until_closed(&mut client).await;

    assert!(proxy.wait_for_metrics(|s| s.connections_open == 0).await);
    let s = proxy.metrics.snapshot();
    assert_eq!(s.bytes_from_client, 4);
    assert_eq!(s.bytes_to_client, 4);

    proxy.shutdown().await;
}

#[tokio::test]
async fn concurrent_clients_are_independent() {
    let upstream = MySqlUpstream::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(ProxyHandle::config(upstream.target())).await;

    let mut clients = Vec::new();
    for i in 0..4u8 {
        let mut client = TcpStream::connect(proxy.addr).await.unwrap();
        read_exactly(&mut client, upstream.greeting.len()).await;
        client.write_all(&[i; 16]).await.unwrap();
        clients.push((i, client));
    }

    for (i, client) in clients.iter_mut() {
        assert_eq!(read_exactly(client, 16).await, vec![*i; 16]);
    }

    assert!(proxy.wait_for_metrics(|s| s.connections_open == 4).await);
    assert_eq!(upstream.connection_count(), 4);

    drop(clients);
    assert!(proxy.wait_for_metrics(|s| s.connections_open == 0).await);
    assert_eq!(proxy.metrics.snapshot().connections_total, 4);

    proxy.shutdown().await;
}

#[tokio::test]
async fn unreachable_upstream_closes_client_and_counts_error() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = dead.local_addr().unwrap().port();
    drop(dead);

    let proxy = ProxyHandle::spawn(ProxyHandle::config(UpstreamTarget::new(
        "127.0.0.1",
        dead_port,
    )))
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    assert!(read_until_closed(&mut client).await.is_empty());

    assert!(proxy.wait_for_metrics(|s| s.errors_total == 1).await);
    let s = proxy.metrics.snapshot();
    assert_eq!(s.connections_total, 0);
    assert_eq!(s.connections_open, 0);

    proxy.shutdown().await;
}

#[tokio::test]
async fn malformed_greeting_closes_client() {
    let mut greeting = harness::handshake_packet("5.7", 42);
    greeting[4] = 9;
    let upstream = MySqlUpstream::spawn_with_greeting(greeting).await.unwrap();
    let proxy = ProxyHandle::spawn(ProxyHandle::config(upstream.target())).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    assert!(read_until_closed(&mut client).await.is_empty());

    assert!(
        proxy
            .wait_for_metrics(|s| s.errors_total == 1 && s.connections_open == 0)
            .await
    );

    proxy.shutdown().await;
}

#[tokio::test]
async fn connections_over_limit_are_rejected() {
    let upstream = MySqlUpstream::spawn().await.unwrap();
    let mut config = ProxyHandle::config(upstream.target());
    config.max_connections = 2;
    let proxy = ProxyHandle::spawn(config).await;

    let mut first = TcpStream::connect(proxy.addr).await.unwrap();
    let mut second = TcpStream::connect(proxy.addr).await.unwrap();
    read_exactly(&mut first, upstream.greeting.len()).await;
    read_exactly(&mut second, upstream.greeting.len()).await;

    let mut third = TcpStream::connect(proxy.addr).await.unwrap();
    assert!(read_until_closed(&mut third).await.is_empty());
    assert_eq!(proxy.metrics.snapshot().connections_rejected, 1);

    drop(first);
    assert!(proxy.wait_for_metrics(|s| s.connections_open == 1).await);

    let mut fourth = TcpStream::connect(proxy.addr).await.unwrap();
    read_exactly(&mut fourth, upstream.greeting.len()).await;

    proxy.shutdown().await;
}
