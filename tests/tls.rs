#![cfg(feature = "tls")]

use ferry_web::{limits::ConnLimits, Handled, Handler, Request, Response, Server, ShutdownHandle};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_rustls::{
    rustls::{
        crypto::ring::default_provider,
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
        ClientConfig, RootCertStore, ServerConfig,
    },
    TlsAcceptor, TlsConnector,
};

struct Hello;

impl Handler for Hello {
    async fn handle(&self, _: &Request, resp: &mut Response) -> Handled {
        resp.body("secret").finish()
    }
}

struct Running {
    addr: SocketAddr,
    handle: ShutdownHandle,
    task: JoinHandle<()>,
    cert: CertificateDer<'static>,
}

async fn start() -> Running {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));

    let config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.clone()], key)
        .unwrap();

    let server = Server::builder()
        .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .handler(Hello)
        .tls(TlsAcceptor::from(Arc::new(config)))
        .connection_limits(ConnLimits {
            tls_handshake_timeout: Duration::from_secs(2),
            ..ConnLimits::default()
        })
        .build();

    Running {
        addr: server.local_addr().unwrap(),
        handle: server.shutdown_handle(),
        task: tokio::spawn(server.launch()),
        cert,
    }
}

async fn wait_idle(handle: &ShutdownHandle) {
    timeout(Duration::from_secs(5), async {
        while handle.active_connections() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection still counted as active");
}

#[tokio::test]
async fn request_over_tls() {
    let server = start().await;

    let mut roots = RootCertStore::empty();
    roots.add(server.cert.clone()).unwrap();
    let config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut out = Vec::new();
    let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection");

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecret"
    );

    server.handle.shutdown();
    server.task.await.unwrap();
}

#[tokio::test]
async fn plaintext_on_tls_port_is_dropped() {
    let server = start().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    // At most a TLS alert comes back, never an HTTP response.
    let mut out = Vec::new();
    let _ = timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("socket stayed open after a failed handshake");
    assert!(!out.starts_with(b"HTTP/"), "{out:?}");

    wait_idle(&server.handle).await;

    server.handle.shutdown();
    server.task.await.unwrap();
}

#[tokio::test]
async fn silent_client_hits_the_handshake_timeout() {
    let server = start().await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let mut out = Vec::new();
    let read = timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("handshake timeout did not close the socket");
    assert!(read.is_ok());
    assert!(out.is_empty());

    wait_idle(&server.handle).await;

    server.handle.shutdown();
    server.task.await.unwrap();
}
