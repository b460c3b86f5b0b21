//! Routing decisions observed from the outside: ruled hosts go to the
//! tunnel (and fail visibly when it is down), loopback stays direct even
//! in global mode, and UDP ASSOCIATE always reports its bound port.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use quicgate_core::{ClientConfig, ClientHandle, LogLevel, Mode, RuleSource};

fn base_config() -> ClientConfig {
    // Port 1 never answers; the tunnel stays down for the whole test.
    let mut config = ClientConfig::new("127.0.0.1:1", "routing-token");
    config.local_port = 0;
    config.log_level = LogLevel::Silent;
    config
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

async fn socks5_handshake(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);
    stream
}

#[tokio::test]
async fn ruled_domain_with_dead_tunnel_reports_host_unreachable() {
    let mut config = base_config();
    config.mode = Mode::Smart;
    config.rules = Some(RuleSource::Inline("example.test".into()));
    let client = ClientHandle::start(config).await.unwrap();

    let mut stream = socks5_handshake(client.local_addr()).await;
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x10];
    request.extend_from_slice(b"sub.example.test");
    request.extend_from_slice(&80u16.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    // The dial attempt to the dead server can hold the connection cell
    // for up to its handshake deadline before the session sees "down".
    let mut reply = [0u8; 10];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut reply))
        .await
        .expect("no reply within the dial deadline")
        .unwrap();
    assert_eq!(reply[1], 0x04);

    client.stop().await;
}

#[tokio::test]
async fn global_mode_keeps_loopback_direct() {
    let echo = spawn_echo_server().await;
    let mut config = base_config();
    config.mode = Mode::Global;
    let client = ClientHandle::start(config).await.unwrap();

    let mut stream = socks5_handshake(client.local_addr()).await;
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00, "loopback must bypass the dead tunnel");

    stream.write_all(b"local").await.unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"local");

    client.stop().await;
}

#[tokio::test]
async fn unruled_host_stays_direct_in_smart_mode() {
    let echo = spawn_echo_server().await;
    let mut config = base_config();
    config.mode = Mode::Smart;
    config.rules = Some(RuleSource::Inline("example.test".into()));
    let client = ClientHandle::start(config).await.unwrap();

    // 127.0.0.1 matches no rule, so the dead tunnel is never consulted.
    let mut stream = socks5_handshake(client.local_addr()).await;
    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&echo.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.stop().await;
}

#[tokio::test]
async fn udp_associate_reports_its_bound_port() {
    let client = ClientHandle::start(base_config()).await.unwrap();

    let mut control = socks5_handshake(client.local_addr()).await;
    control
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    control.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[1], 0x00);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    assert_ne!(port, 0);

    // With the tunnel down the association is torn down right after the
    // reply; the control socket observes the close.
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(10), control.read(&mut buf))
        .await
        .expect("control socket should close")
        .unwrap();
    assert_eq!(n, 0);

    client.stop().await;
}
