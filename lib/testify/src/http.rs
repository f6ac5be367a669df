use std::convert::Infallible;
use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

/// HTTP status code 404
pub fn not_found() -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(b"Not Found")));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

/// A response with the status and body
pub fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

/// Start an HTTP/1 server on a random local port, every connection is
/// handled by `handler`. The listener is bound before returning, so the
/// address is reachable right away.
pub async fn serve<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind test server failed, {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("get local addr failed, {err}"));

    tokio::spawn(async move {
        loop {
            let (conn, _peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(message = "accept connection failed", %err);
                    continue;
                }
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(conn), service)
                    .await
                {
                    tracing::debug!(message = "serve connection failed", %err);
                }
            });
        }
    });

    addr
}
