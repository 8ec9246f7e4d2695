use ferry_web::{
    compress,
    limits::{ConnLimits, ServerLimits},
    Handled, Handler, Request, Response, Server, ShutdownHandle, StatusCode,
};
use std::{net::SocketAddr, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::{sleep, timeout},
};

struct App;

impl Handler for App {
    async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
        match req.path() {
            "/" => resp.body("Hello world!").finish(),
            "/slow" => {
                sleep(Duration::from_millis(50)).await;
                resp.body("slow").finish()
            }
            "/gzip" => resp
                .header("Content-Type", "text/plain")
                .body("a".repeat(10_000))
                .compress_body(6)
                .finish(),
            "/echo" => resp.body(req.body()).finish(),
            "/events" => {
                let (handled, events) = resp.event_stream();
                tokio::spawn(async move {
                    for n in 0..3 {
                        if events.send("count", n.to_string()).await.is_err() {
                            break;
                        }
                    }
                });
                handled
            }
            _ => resp.set_status(StatusCode::NotFound),
        }
    }
}

struct Running {
    addr: SocketAddr,
    handle: ShutdownHandle,
    task: JoinHandle<()>,
}

async fn start(server_limits: ServerLimits) -> Running {
    let server = Server::builder()
        .listener(TcpListener::bind("127.0.0.1:0").await.unwrap())
        .handler(App)
        .server_limits(server_limits)
        .connection_limits(ConnLimits {
            idle_timeout: Duration::from_secs(5),
            ..ConnLimits::default()
        })
        .build();

    Running {
        addr: server.local_addr().unwrap(),
        handle: server.shutdown_handle(),
        task: tokio::spawn(server.launch()),
    }
}

async fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut out = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    out
}

fn split(response: &[u8]) -> (String, Vec<u8>) {
    let end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no blank line in response");

    (
        String::from_utf8(response[..end + 4].to_vec()).unwrap(),
        response[end + 4..].to_vec(),
    )
}

#[tokio::test]
async fn hello_over_tcp() {
    let server = start(ServerLimits::default()).await;

    let out = exchange(server.addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "HTTP/1.1 200 OK\r\nContent-Length: 12\r\nConnection: close\r\n\r\nHello world!"
    );

    server.handle.shutdown();
    server.task.await.unwrap();
}

#[tokio::test]
async fn pipelined_over_tcp() {
    let server = start(ServerLimits::default()).await;

    let out = exchange(
        server.addr,
        b"GET /slow HTTP/1.1\r\n\r\n\
          GET /missing HTTP/1.1\r\n\r\n\
          POST /echo HTTP/1.1\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping",
    )
    .await;

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nslow\
         HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n\
         HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping"
    );

    server.handle.shutdown();
    server.task.await.unwrap();
}

#[tokio::test]
async fn gzip_body_round_trips() {
    let server = start(ServerLimits::default()).await;

    let out = exchange(
        server.addr,
        b"GET /gzip HTTP/1.1\r\nAccept-Encoding: gzip, deflate\r\nConnection: close\r\n\r\n",
    )
    .await;
    let (head, body) = split(&out);

    assert!(head.contains("Content-Encoding: gzip\r\n"), "{head}");
    assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
    assert!(body.len() < 10_000);
    assert_eq!(compress::decompress(&body), "a".repeat(10_000).into_bytes());

    let plain = exchange(server.addr, b"GET /gzip HTTP/1.1\r\nConnection: close\r\n\r\n").await;
    let (head, body) = split(&plain);
    assert!(!head.contains("Content-Encoding"));
    assert_eq!(body.len(), 10_000);

    server.handle.shutdown();
    server.task.await.unwrap();
}

#[tokio::test]
async fn event_stream_over_tcp() {
    let server = start(ServerLimits::default()).await;

    let out = exchange(server.addr, b"GET /events HTTP/1.1\r\n\r\n").await;
    let (head, frames) = split(&out);

    assert!(head.contains("Content-Type: text/event-stream\r\n"));
    assert_eq!(
        String::from_utf8(frames).unwrap(),
        "event: count\r\ndata: 0\r\n\r\n\
         event: count\r\ndata: 1\r\n\r\n\
         event: count\r\ndata: 2\r\n\r\n"
    );

    server.handle.shutdown();
    server.task.await.unwrap();
}

#[tokio::test]
async fn overflow_gets_503() {
    let server = start(ServerLimits {
        max_connections: 1,
        max_pending_connections: 0,
        ..ServerLimits::default()
    })
    .await;

    // Nothing is sent: the 503 goes out without reading the socket.
    let out = exchange(server.addr, b"").await;
    let (head, body) = split(&out);

    assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"), "{head}");
    assert!(head.contains("Connection: close\r\n"));
    assert!(String::from_utf8(body).unwrap().contains("SERVICE_UNAVAILABLE"));

    server.handle.shutdown();
    server.task.await.unwrap();
}

#[tokio::test]
async fn shutdown_closes_open_connections() {
    let server = start(ServerLimits::default()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut buf = [0; 64];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(buf[..n].starts_with(b"HTTP/1.1 200 OK\r\n"));
    assert_eq!(server.handle.active_connections(), 1);

    server.handle.shutdown();
    assert!(server.handle.is_shutdown());

    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("connection stayed open after shutdown")
        .unwrap();

    timeout(Duration::from_secs(5), server.task)
        .await
        .expect("launch did not return")
        .unwrap();
    assert_eq!(server.handle.active_connections(), 0);
}
