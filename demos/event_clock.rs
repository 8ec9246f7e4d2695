//! Server-sent events: `curl -N http://127.0.0.1:8080/clock`

use ferry_web::{Handled, Handler, Request, Response, Server, StatusCode};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::{net::TcpListener, time::interval};

struct Clock;

impl Handler for Clock {
    async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
        if req.path() != "/clock" {
            return resp.set_status(StatusCode::NotFound);
        }

        let (handled, events) = resp.event_stream();
        tokio::spawn(async move {
            let mut ticks = interval(Duration::from_secs(1));
            loop {
                ticks.tick().await;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or_default();

                if events.send("tick", now.to_string()).await.is_err() {
                    break; // client left
                }
            }
        });
        handled
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let server = Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(Clock)
        .build();

    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        handle.shutdown();
    });

    server.launch().await;
}
