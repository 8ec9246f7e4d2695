//! Serves `./public` with gzip (when the client accepts it) and cache headers.

use ferry_web::{
    limits::RespLimits, FileOptions, Handled, Handler, Request, Response, Server, StatusCode,
};
use std::time::Duration;
use tokio::net::TcpListener;

struct Files {
    root: &'static str,
}

impl Handler for Files {
    async fn handle(&self, req: &Request, resp: &mut Response) -> Handled {
        let path = match req.path() {
            "/" => "/index.html",
            path if path.split('/').any(|part| part == "..") => {
                return resp.set_error(StatusCode::Forbidden, "forbidden", true)
            }
            path => path,
        };

        let options = FileOptions {
            charset: Some("utf-8".into()),
            max_age: Some(Duration::from_secs(3600)),
            ..FileOptions::default()
        };
        resp.send_file(format!("{}{path}", self.root), options).await
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    Server::builder()
        .listener(TcpListener::bind("127.0.0.1:8080").await.unwrap())
        .handler(Files { root: "./public" })
        .response_limits(RespLimits {
            compression_level: Some(6),
            ..RespLimits::default()
        })
        .build()
        .launch()
        .await;
}
