use std::io::ErrorKind;

use futures_util::{stream::BoxStream, StreamExt};
use tokio::io::{AsyncRead, ReadHalf, SimplexStream, WriteHalf};
use tokio_util::{
    io::{ReaderStream, StreamReader},
    sync::CancellationToken,
};
use tonic::transport::Channel;
use tracing::info;

use crate::proto::{self, tunnel_client::TunnelClient};

/// The maximum amount of bytes to buffer before a gRPC frame must be produced.
const BUFSIZE: usize = 16 * 1024;

pub type Tunnel<R> = tokio::io::Join<R, WriteHalf<SimplexStream>>;

pub type ClientSideTunnel = Tunnel<ReadHalf<SimplexStream>>;

/// Type-erased read half, so a server can hand a [`Tunnel`] to a handler
/// without leaking the concrete `StreamReader<...>` type.
pub type BoxAsyncRead = Box<dyn AsyncRead + Send + Unpin>;

pub type ServerSideTunnel = Tunnel<BoxAsyncRead>;

/// Turn the server's view of an accepted `OpenTunnel` bidi stream into a
/// duplex byte stream, plus the outgoing frame stream tonic should return
/// as the RPC response.
pub fn server_side_tunnel(
    incoming: tonic::Streaming<proto::Frame>,
) -> (
    ServerSideTunnel,
    BoxStream<'static, tonic::Result<proto::Frame>>,
) {
    let incoming_stream_reader = {
        let mapped = incoming.map(|result| {
            result.map(|frame| frame.payload).map_err(|status| {
                info!(?status, "input stream error");
                std::io::Error::new(ErrorKind::BrokenPipe, "broken pipe")
            })
        });
        StreamReader::new(mapped)
    };

    let (outgoing_read_half, outgoing_write_half) = tokio::io::simplex(BUFSIZE);

    (
        tokio::io::join(
            Box::new(incoming_stream_reader) as BoxAsyncRead,
            outgoing_write_half,
        ),
        ReaderStream::new(outgoing_read_half)
            .map(|result| match result {
                Ok(payload) => Ok(proto::Frame { payload }),
                Err(err) => {
                    info!(?err, "tunnel outgoing error");
                    Err(tonic::Status::cancelled("closed"))
                }
            })
            .boxed(),
    )
}

/// Open a tunnel from the agent side: dial `OpenTunnel`, attach the
/// authentication metadata, and turn the bidi stream into a duplex byte
/// stream the inner HTTP/2 server can be driven over.
pub async fn client_side_tunnel(
    mut client: TunnelClient<Channel>,
    agent_id: &str,
    password: &str,
    remote_spec: &str,
    close_signal: CancellationToken,
) -> tonic::Result<ClientSideTunnel> {
    let (outgoing_read_half, outgoing_write_half) = tokio::io::simplex(BUFSIZE);
    let (incoming_read_half, mut incoming_write_half) = tokio::io::simplex(BUFSIZE);

    let outgoing = ReaderStream::new(outgoing_read_half).scan((), |_, result| async {
        match result {
            Ok(payload) => Some(proto::Frame { payload }),
            Err(err) => {
                info!(?err, "tunnel outgoing error");
                None
            }
        }
    });

    let mut request = tonic::Request::new(outgoing);
    for (key, value) in [
        (crate::META_AGENT_ID, agent_id),
        (crate::META_PASSWORD, password),
        (crate::META_REMOTE_SPEC, remote_spec),
    ] {
        request.metadata_mut().insert(
            key,
            value
                .parse()
                .map_err(|_| tonic::Status::invalid_argument("invalid metadata value"))?,
        );
    }

    let response = client.open_tunnel(request).await?;

    let mut incoming_reader = StreamReader::new(response.into_inner().map(|result| {
        result.map(|frame| frame.payload).map_err(|status| {
            info!(?status, "input stream error");
            std::io::Error::new(ErrorKind::BrokenPipe, "broken pipe")
        })
    }));

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::io::copy(&mut incoming_reader, &mut incoming_write_half) => {
                if let Err(err) = result {
                    info!(?err, "client tunnel incoming error");
                }
            }
            _ = close_signal.cancelled() => {}
        }
    });

    Ok(tokio::io::join(incoming_read_half, outgoing_write_half))
}
