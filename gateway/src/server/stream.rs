use std::pin::Pin;

use futures::{Stream, StreamExt};
use protos::bmc::v1::ConsoleDataChunk;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use super::GatewayApi;

pub(crate) type ConsoleOutStream =
    Pin<Box<dyn Stream<Item = Result<ConsoleDataChunk, Status>> + Send + 'static>>;

fn close_chunk(session_id: &str, server_id: &str) -> ConsoleDataChunk {
    ConsoleDataChunk {
        session_id: session_id.to_owned(),
        server_id: server_id.to_owned(),
        data: Default::default(),
        is_handshake: false,
        close_stream: true,
    }
}

/// Multiplex one tenant console stream onto a stream to the owning agent.
///
/// The first inbound frame must be a handshake naming the session and server;
/// the bearer server token on the stream's metadata must be bound to the same
/// server. After validation the gateway is a dumb pipe: frames are relayed in
/// order, in both directions, until a close_stream frame or an error.
pub(super) async fn stream_console_data(
    api: &GatewayApi,
    request: Request<Streaming<ConsoleDataChunk>>,
) -> Result<Response<ConsoleOutStream>, Status> {
    let metadata = request.metadata().clone();
    let mut inbound = request.into_inner();

    let handshake = inbound
        .next()
        .await
        .unwrap_or_else(|| Err(Status::aborted("connection closed before handshake")))?;
    if !handshake.is_handshake {
        return Err(Status::invalid_argument(
            "first console frame must be a handshake",
        ));
    }

    let context = api.check_server_token(&metadata)?;
    let session = api
        .sessions()
        .get(&handshake.session_id)
        .filter(|s| s.server_id == handshake.server_id && s.server_id == context.server_id)
        .ok_or_else(|| {
            Status::not_found(format!("session {} not found", handshake.session_id))
        })?;

    let mut agent_client = api.agents().client_for(&session.datacenter_id).ok_or_else(|| {
        Status::failed_precondition(format!(
            "no agent registered for datacenter {}",
            session.datacenter_id
        ))
    })?;

    // Open the agent-side stream, leading with our own handshake frame.
    let (to_agent, to_agent_rx) = mpsc::channel::<ConsoleDataChunk>(32);
    to_agent
        .send(handshake.clone())
        .await
        .map_err(|_| Status::internal("agent stream closed before handshake"))?;
    let mut from_agent = agent_client
        .stream_console(Request::new(ReceiverStream::new(to_agent_rx)))
        .await?
        .into_inner();

    metrics::increment_counter!("bmc_gateway_console_streams_total");
    log::info!(
        "console stream open: session {} server {} -> datacenter {}",
        session.id,
        session.server_id,
        session.datacenter_id
    );

    // Tenant -> agent pump. A broken tenant stream is converted into an
    // orderly close_stream towards the agent so the subprocess unwinds.
    let session_id = session.id.clone();
    let server_id = session.server_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(chunk) => {
                    let close = chunk.close_stream;
                    if to_agent.send(chunk).await.is_err() {
                        break;
                    }
                    if close {
                        break;
                    }
                }
                Err(status) => {
                    log::debug!("console stream from tenant ended: {status}");
                    let _ = to_agent.send(close_chunk(&session_id, &server_id)).await;
                    break;
                }
            }
        }
    });

    // Agent -> tenant direction, ending after relaying a close_stream.
    let out = async_stream::try_stream! {
        while let Some(frame) = from_agent.next().await {
            let chunk = frame?;
            let close = chunk.close_stream;
            yield chunk;
            if close {
                break;
            }
        }
    };
    Ok(Response::new(Box::pin(out)))
}
