//! Agent-side dialer: opens the reverse tunnel to the hub and serves the
//! agent's local HTTP handler over it until the tunnel closes or `cancel`
//! fires.
//!
//! Known bug carried from the teacher's `authly-connect` client: on a mid-
//! session channel failure there is no reconnect here — the caller (the
//! agent session loop) is the one that notices and re-dials from scratch.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_util::sync::CancellationToken;
use tonic::transport::{ClientTlsConfig, Endpoint};
use tower::Service;
use tracing::info;

use crate::{proto::tunnel_client::TunnelClient, relay, tunnel::client_side_tunnel};

pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dial `OpenTunnel` against `hub_uri`, authenticate with `(agent_id,
/// password)`, claim `remote_spec`, and serve `local_service` over the
/// resulting duplex stream until the tunnel ends or `cancel` fires.
///
/// Resolves once the tunnel handshake completes; the relay itself runs in a
/// spawned task, whose `JoinHandle` is returned so the caller can await its
/// natural end (the remote side closing the stream) as distinct from
/// `cancel` firing.
pub async fn connect_and_serve<Svc, B>(
    hub_uri: String,
    tls_client_config: Arc<ClientConfig>,
    agent_id: &str,
    password: &str,
    remote_spec: &str,
    local_service: Svc,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<Result<(), String>>>
where
    Svc: Service<http::Request<hyper::body::Incoming>, Response = http::Response<B>>
        + Clone
        + Send
        + 'static,
    Svc::Future: Send,
    Svc::Error: Into<StdError>,
    B: http_body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    let tls_config = ClientTlsConfig::new().rustls_client_config((*tls_client_config).clone());

    let channel = Endpoint::from_shared(hub_uri)?
        .tls_config(tls_config)?
        .connect()
        .await?;

    let close_signal = cancel.child_token();

    let duplex_tunnel = client_side_tunnel(
        TunnelClient::new(channel),
        agent_id,
        password,
        remote_spec,
        close_signal.clone(),
    )
    .await?;

    info!(%agent_id, %remote_spec, "reverse tunnel established");

    Ok(tokio::spawn(relay::serve_over_tunnel(
        duplex_tunnel,
        local_service,
        close_signal,
    )))
}
