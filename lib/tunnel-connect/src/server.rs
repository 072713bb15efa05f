use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    proto, tunnel, TunnelAuthError, TunnelAuthenticator, META_AGENT_ID, META_PASSWORD,
    META_REMOTE_SPEC,
};

/// Invoked once per accepted, authenticated tunnel. Implementations own the
/// tunnel from here on: they are expected to spawn whatever relay they need
/// and return quickly.
pub trait TunnelRelayHandler: Send + Sync + 'static {
    fn on_tunnel_opened(
        &self,
        agent_id: String,
        remote_spec: String,
        tunnel: tunnel::ServerSideTunnel,
        cancel: CancellationToken,
    );
}

#[derive(Clone)]
pub struct TunnelServerImpl<A, H> {
    pub authenticator: Arc<A>,
    pub handler: Arc<H>,
    pub cancel: CancellationToken,
}

#[tonic::async_trait]
impl<A, H> proto::tunnel_server::Tunnel for TunnelServerImpl<A, H>
where
    A: TunnelAuthenticator,
    H: TunnelRelayHandler,
{
    type OpenTunnelStream = BoxStream<'static, tonic::Result<proto::Frame>>;

    async fn open_tunnel(
        &self,
        request: tonic::Request<tonic::Streaming<proto::Frame>>,
    ) -> tonic::Result<tonic::Response<Self::OpenTunnelStream>> {
        let agent_id = required_metadata(&request, META_AGENT_ID)?;
        let password = required_metadata(&request, META_PASSWORD)?;
        let remote_spec = required_metadata(&request, META_REMOTE_SPEC)?;

        self.authenticator
            .authenticate(&agent_id, &password, &remote_spec)
            .await
            .map_err(|err| match err {
                TunnelAuthError::UnknownUser | TunnelAuthError::InvalidAuth => {
                    tonic::Status::unauthenticated("authentication failed")
                }
                TunnelAuthError::ConstraintMismatch => {
                    tonic::Status::permission_denied("remote spec not permitted for this agent")
                }
            })?;

        info!(%agent_id, %remote_spec, "tunnel opened");

        let incoming = request.into_inner();
        let (duplex, outgoing) = tunnel::server_side_tunnel(incoming);

        self.handler.on_tunnel_opened(
            agent_id,
            remote_spec,
            duplex,
            self.cancel.child_token(),
        );

        Ok(tonic::Response::new(outgoing))
    }
}

fn required_metadata(
    request: &tonic::Request<tonic::Streaming<proto::Frame>>,
    key: &str,
) -> tonic::Result<String> {
    let value = request
        .metadata()
        .get(key)
        .ok_or_else(|| {
            warn!(key, "missing required tunnel metadata");
            tonic::Status::invalid_argument(format!("missing `{key}` metadata"))
        })?
        .to_str()
        .map_err(|_| tonic::Status::invalid_argument(format!("`{key}` metadata is not ASCII")))?
        .to_string();
    Ok(value)
}
