//! Handlers on one connection run concurrently; responses still leave in order.
//!
//! ```text
//! printf 'GET /sleep?ms=300 HTTP/1.1\r\n\r\nGET /sleep?ms=10 HTTP/1.1\r\n\r\n' | nc 127.0.0.1 8080
//! ```

use ferry_web::{Handled, Handler, Request, Response, Server, StatusCode};
use std::time::{Duration, Instant};
use tokio::{net::TcpListener, time::sleep};
use tracing::info;

struct Sleeper {
    started: Instant,
}

impl Handler for Sleeper {
    async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
        let Some(ms) = req.query_param("ms").and_then(|ms| ms.parse().ok()) else {
            return resp.set_error(StatusCode::BadRequest, "expected ?ms=<number>", false);
        };

        sleep(Duration::from_millis(ms)).await;
        let done = self.started.elapsed().as_millis() as u64;
        info!(ms, done, "handler finished");

        resp.header("Content-Type", "text/plain")
            .body(format!("slept {ms} ms, done at {done} ms\n"))
            .finish()
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(Sleeper {
            started: Instant::now(),
        })
        .build()
        .launch()
        .await;
}
