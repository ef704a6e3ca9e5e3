//! End-to-end flows through real relays on loopback.
//!
//! Each relay runs its own event loop on a std thread; clients and
//! destinations are tokio tasks on the test runtime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

use ssrelay::crypto::Method;
use ssrelay::eventloop::StopHandle;
use ssrelay::relay::Mode;
use ssrelay::socks::Address;
use ssrelay::{Config, Proxy, Stats};

const PASSWORD: &str = "correct horse battery staple";

struct Running {
    tcp: SocketAddr,
    udp: Option<SocketAddr>,
    handle: StopHandle,
    stats: Arc<Stats>,
    thread: thread::JoinHandle<ssrelay::Result<()>>,
}

impl Running {
    fn stop(self) {
        self.handle.stop();
        self.thread.join().unwrap().unwrap();
    }
}

fn start(config: Config) -> Running {
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let proxy = Proxy::bind(&config, Arc::new(Stats::new())).unwrap();
        tx.send((proxy.tcp_addr(), proxy.udp_addr(), proxy.stop_handle(), proxy.stats()))
            .unwrap();
        proxy.run()
    });
    let (tcp, udp, handle, stats) = rx.recv().unwrap();
    Running {
        tcp,
        udp,
        handle,
        stats,
        thread,
    }
}

fn server_config() -> Config {
    Config {
        mode: Mode::Server,
        server: Some("127.0.0.1".into()),
        server_port: 0,
        password: PASSWORD.into(),
        dns_server: Some(vec!["127.0.0.1:9".into()]),
        sweep_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

fn local_config(server: &Running) -> Config {
    Config {
        mode: Mode::Local,
        server: Some("127.0.0.1".into()),
        server_port: server.tcp.port(),
        local_address: "127.0.0.1".into(),
        local_port: 0,
        password: PASSWORD.into(),
        dns_server: Some(vec!["127.0.0.1:9".into()]),
        sweep_interval: Duration::from_millis(50),
        ..Config::default()
    }
}

/// Local relay chained to a server relay.
fn start_chain(server: Config) -> (Running, Running) {
    let server = start(server);
    let local = start(local_config(&server));
    (local, server)
}

async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.into_split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

async fn udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// SOCKS5 greeting plus one request; returns the stream and the reply.
async fn socks_request(proxy: SocketAddr, command: u8, target: &Address) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[5, 1, 0]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [5, 0]);

    let mut request = vec![5, command, 0];
    target.write_to(&mut request);
    stream.write_all(&request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply.to_vec())
}

async fn socks_connect(proxy: SocketAddr, target: &Address) -> TcpStream {
    let (stream, reply) = socks_request(proxy, 1, target).await;
    assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);
    stream
}

#[tokio::test]
async fn local_relay_speaks_encrypted_protocol_to_server() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let local = start(Config {
        mode: Mode::Local,
        server: Some("127.0.0.1".into()),
        server_port: upstream_addr.port(),
        local_port: 0,
        password: PASSWORD.into(),
        dns_server: Some(vec!["127.0.0.1:9".into()]),
        ..Config::default()
    });

    let request = b"GET / HTTP/1.0\r\n\r\n";
    let response = b"HTTP/1.0 200 OK\r\n\r\nhello";
    let server = tokio::spawn(async move {
        let cipher = Method::Chacha20IetfPoly1305.cipher(PASSWORD);
        let (mut stream, _) = upstream.accept().await.unwrap();
        let mut decryptor = cipher.decryptor();
        let mut plain = Vec::new();
        let expected_len = 2 + 11 + 2 + request.len();
        let mut buf = [0u8; 4096];
        while plain.len() < expected_len {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "relay closed early");
            decryptor.decrypt(&buf[..n], &mut plain).unwrap();
        }
        let mut sealed = Vec::new();
        cipher.encryptor().encrypt(response, &mut sealed).unwrap();
        stream.write_all(&sealed).await.unwrap();
        plain
    });

    let mut client = socks_connect(local.tcp, &Address::Domain("example.com".into(), 80)).await;
    client.write_all(request).await.unwrap();
    let mut reply = vec![0u8; response.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();

    let plain = server.await.unwrap();
    let mut expected = vec![0x03, 11];
    expected.extend_from_slice(b"example.com");
    expected.extend_from_slice(&[0x00, 0x50]);
    expected.extend_from_slice(request);
    assert_eq!(plain, expected);
    assert_eq!(reply, response);
    local.stop();
}

#[tokio::test]
async fn chained_relays_preserve_order() {
    let echo = tcp_echo().await;

    // Server config comes from a JSON file, host override included.
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(
        &mut file,
        format!(
            r#"{{"mode": "server", "server": "127.0.0.1", "server_port": 0,
                "password": "{PASSWORD}", "dns_server": ["127.0.0.1:9"],
                "sweep_interval": 0.05, "hosts": {{"echo.test": "127.0.0.1"}}}}"#
        )
        .as_bytes(),
    )
    .unwrap();
    let (local, server) = start_chain(Config::load(file.path()).unwrap());

    let client = socks_connect(local.tcp, &Address::Domain("echo.test".into(), echo.port())).await;
    let (mut rd, mut wr) = client.into_split();
    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 251) as u8).collect();
    let sent = payload.clone();
    let writer = tokio::spawn(async move {
        for chunk in sent.chunks(7001) {
            wr.write_all(chunk).await.unwrap();
        }
        wr
    });
    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), rd.read_exact(&mut echoed))
        .await
        .unwrap()
        .unwrap();
    drop(writer.await.unwrap());

    assert!(echoed == payload, "echoed bytes differ");
    let stats = local.stats.snapshot();
    assert_eq!(stats.tcp_opened, 1);
    assert!(stats.bytes_up >= payload.len() as u64);
    assert!(server.stats.snapshot().bytes_down >= payload.len() as u64);
    local.stop();
    server.stop();
}

#[tokio::test]
async fn concurrent_clients_stay_separate() {
    let echo = tcp_echo().await;
    let (local, server) = start_chain(server_config());

    let clients = (0..16u8).map(|i| async move {
        let mut stream = socks_connect(local.tcp, &Address::Socket(echo)).await;
        let message = vec![i; 1000 + i as usize * 100];
        stream.write_all(&message).await.unwrap();
        let mut echoed = vec![0u8; message.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        echoed == message
    });
    let results = timeout(Duration::from_secs(10), futures::future::join_all(clients))
        .await
        .unwrap();

    assert!(results.into_iter().all(|ok| ok));
    assert_eq!(local.stats.snapshot().tcp_opened, 16);
    local.stop();
    server.stop();
}

#[tokio::test]
async fn idle_sessions_are_evicted() {
    let echo = tcp_echo().await;
    let (local, server) = start_chain(Config {
        timeout: Duration::from_millis(300),
        ..server_config()
    });

    let mut client = socks_connect(local.tcp, &Address::Socket(echo)).await;
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();

    // The server side drops the idle session; the local side follows.
    let n = timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);

    assert_eq!(n, 0);
    assert!(server.stats.snapshot().tcp_evicted >= 1);
    local.stop();
    server.stop();
}

#[tokio::test]
async fn malformed_handshake_is_isolated() {
    let echo = tcp_echo().await;
    let (local, server) = start_chain(server_config());

    let mut good = socks_connect(local.tcp, &Address::Socket(echo)).await;
    let mut bad = TcpStream::connect(local.tcp).await.unwrap();
    bad.write_all(&[4, 1, 0, 80, 127, 0, 0, 1, 0]).await.unwrap();
    let mut rest = Vec::new();
    let _ = timeout(Duration::from_secs(5), bad.read_to_end(&mut rest)).await.unwrap();

    good.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    good.read_exact(&mut buf).await.unwrap();

    assert!(rest.is_empty());
    assert_eq!(&buf, b"still here");
    assert_eq!(local.stats.snapshot().tcp_failed, 1);
    local.stop();
    server.stop();
}

#[tokio::test]
async fn unreachable_destination_closes_session() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (local, server) = start_chain(server_config());

    let mut client = socks_connect(local.tcp, &Address::Socket(closed)).await;
    let mut rest = Vec::new();
    let _ = timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await.unwrap();

    assert!(rest.is_empty());
    assert_eq!(server.stats.snapshot().tcp_failed, 1);
    local.stop();
    server.stop();
}

#[tokio::test]
async fn stalled_destination_pauses_client() {
    // Accepts and never reads.
    let sink = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sink_addr = sink.local_addr().unwrap();
    let held = tokio::spawn(async move { sink.accept().await.map(|(stream, _)| stream) });
    let (local, server) = start_chain(server_config());

    let mut client = socks_connect(local.tcp, &Address::Socket(sink_addr)).await;
    let chunk = vec![0x5Au8; 64 * 1024];
    let limit = 128 * 1024 * 1024;
    let mut written = 0usize;
    while written < limit {
        match timeout(Duration::from_millis(500), client.write(&chunk)).await {
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) => panic!("client write failed: {e}"),
            Err(_) => break,
        }
    }
    assert!(written < limit, "relay absorbed {written} bytes without pausing");

    let relayed = local.stats.snapshot().bytes_up;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(local.stats.snapshot().bytes_up, relayed, "relay kept reading");
    assert!(relayed < written as u64);
    drop(held);
    local.stop();
    server.stop();
}

#[tokio::test]
async fn udp_associate_round_trip() {
    let echo = udp_echo().await;
    let (local, server) = start_chain(server_config());
    let relay_udp = local.udp.unwrap();
    assert_eq!(relay_udp, local.tcp);

    let unspecified = Address::Socket("0.0.0.0:0".parse().unwrap());
    let (_control, reply) = socks_request(local.tcp, 3, &unspecified).await;
    let mut expected_reply = vec![5, 0, 0];
    Address::Socket(relay_udp).write_to(&mut expected_reply);
    assert_eq!(reply, expected_reply);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut packet = vec![0, 0, 0];
    Address::Socket(echo).write_to(&mut packet);
    packet.extend_from_slice(b"ping");
    let mut buf = [0u8; 2048];
    for _ in 0..3 {
        socket.send_to(&packet, relay_udp).await.unwrap();
        let (n, _) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], packet.as_slice());
    }

    assert_eq!(local.stats.snapshot().udp_opened, 1);
    assert_eq!(server.stats.snapshot().udp_opened, 1);
    local.stop();
    server.stop();
}

#[tokio::test]
async fn graceful_shutdown_drains_open_sessions() {
    let echo = tcp_echo().await;
    let (local, server) = start_chain(server_config());
    let mut client = socks_connect(local.tcp, &Address::Socket(echo)).await;

    local.handle.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(TcpStream::connect(local.tcp).await.is_err());
    client.write_all(b"after").await.unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after");
    drop(client);

    let Running { thread, .. } = local;
    let joined = timeout(Duration::from_secs(3), tokio::task::spawn_blocking(move || thread.join()))
        .await
        .expect("relay did not drain");
    joined.unwrap().unwrap().unwrap();
    server.stop();
}
