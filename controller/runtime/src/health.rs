use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, net::SocketAddr};
use tokio::{net::TcpListener, sync::watch};
use tracing::{debug, info, instrument};

/// Serves `/healthz` and `/readyz`, both succeeding once the local cluster's
/// connector has synced its caches.
#[instrument(skip(ready, drain))]
pub async fn serve(
    addr: SocketAddr,
    ready: watch::Receiver<bool>,
    drain: drain::Watch,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Health server listening");

    let shutdown = drain.signaled();
    tokio::pin!(shutdown);
    loop {
        let (io, peer) = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            res = listener.accept() => res?,
        };

        let ready = ready.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let rsp = handle(&ready, &req);
                async move { Ok::<_, Infallible>(rsp) }
            });
            if let Err(error) = http1::Builder::new()
                .serve_connection(TokioIo::new(io), svc)
                .await
            {
                debug!(%peer, %error, "Health connection failed");
            }
        });
    }
}

fn handle<B>(ready: &watch::Receiver<bool>, req: &Request<B>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/healthz" | "/readyz" => {}
        _ => return empty(StatusCode::NOT_FOUND),
    }

    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return empty(StatusCode::METHOD_NOT_ALLOWED);
    }

    let (status, body) = if *ready.borrow() {
        (StatusCode::OK, "ready\n")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
    };
    let mut rsp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *rsp.status_mut() = status;
    rsp.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    rsp
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    let mut rsp = Response::new(Full::default());
    *rsp.status_mut() = status;
    rsp
}
