//! Turns a raw tunnel duplex stream into an HTTP/2 relay.
//!
//! The agent always *dials* the `OpenTunnel` RPC (it must be able to reach
//! the hub through NAT/firewalls the other way can't cross), but the bytes
//! that matter flow the other way: the hub sends requests, the agent serves
//! them against its local Kubernetes API proxy. So the gRPC roles and the
//! HTTP roles are inverted relative to each other: the hub (gRPC acceptor)
//! is the HTTP/2 *client* over the tunnel, and the agent (gRPC dialer) is
//! the HTTP/2 *server*.

use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tower::Service;
use tracing::info;

pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The hub side: drive an HTTP/2 client handshake over the tunnel and
/// return a [`tower::Service`] that sends requests into it.
pub async fn relay_as_http2_client<S>(tunnel: S) -> anyhow::Result<RelayedHttpService>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_request, connection) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .handshake::<_, Body>(TokioIo::new(tunnel))
        .await?;

    tokio::spawn(async move {
        if let Err(err) = connection.await {
            info!(?err, "tunnel relay connection closed");
        }
    });

    Ok(RelayedHttpService {
        send_request_buffer: tower::buffer::Buffer::new(SendTunneledRequest { send_request }, 1024),
    })
}

/// The agent side: serve an axum/hyper service directly over the tunnel
/// until the connection ends or `cancel` fires.
///
/// Returns `Ok(())` when the connection ended cleanly (including via
/// `cancel` firing and the subsequent graceful shutdown completing) and
/// `Err` with the connection error's message otherwise, so a caller such
/// as the agent session loop can classify *why* the session ended instead
/// of only learning that it did.
pub async fn serve_over_tunnel<S, Svc, B>(
    tunnel: S,
    service: Svc,
    cancel: CancellationToken,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Svc: Service<http::Request<hyper::body::Incoming>, Response = http::Response<B>>
        + Clone
        + Send
        + 'static,
    Svc::Future: Send,
    Svc::Error: Into<StdError>,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let connection_builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let connection = connection_builder.serve_connection_with_upgrades(
        TokioIo::new(tunnel),
        hyper::service::service_fn(move |req| {
            let mut service = service.clone();
            async move { service.call(req).await }
        }),
    );
    tokio::pin!(connection);

    loop {
        tokio::select! {
            biased;
            result = connection.as_mut() => {
                return match result {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        info!(?err, "tunnel-served connection ended with error");
                        Err(err.to_string())
                    }
                };
            }
            _ = cancel.cancelled() => {
                connection.as_mut().graceful_shutdown();
            }
        }
    }
}

#[derive(Clone)]
pub struct RelayedHttpService {
    send_request_buffer: tower::buffer::Buffer<
        http::Request<Body>,
        <SendTunneledRequest as Service<http::Request<Body>>>::Future,
    >,
}

impl Service<http::Request<Body>> for RelayedHttpService {
    type Response = http::Response<Body>;
    type Error = StdError;
    type Future = tower::buffer::future::ResponseFuture<
        <SendTunneledRequest as Service<http::Request<Body>>>::Future,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::poll_ready(&mut self.send_request_buffer, cx)
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        self.send_request_buffer.call(req)
    }
}

struct SendTunneledRequest {
    send_request: hyper::client::conn::http2::SendRequest<Body>,
}

impl Service<http::Request<Body>> for SendTunneledRequest {
    type Response = http::Response<Body>;
    type Error = StdError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.send_request.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        let fut = self.send_request.send_request(req);
        Box::pin(async move {
            fut.await
                .map_err(Into::into)
                .map(|res| res.map(tonic::body::Body::new))
        })
    }
}
