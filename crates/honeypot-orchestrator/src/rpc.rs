//! Provider RPC server
//!
//! Speaks the same private length-prefixed frame protocol the frontend's
//! `ProviderClient` speaks, on the listening side. One TCP connection can
//! carry multiple concurrent `Acquire`/`Yield` calls multiplexed by
//! [`RequestId`], so each request is handled on its own task and replies are
//! funneled back through a single writer task that owns the socket's write
//! half — mirroring the frontend's connection actor, just with the roles of
//! reader and writer split into two tasks instead of one `select!` loop,
//! since a `Yield` reply here is a multi-frame stream that must not block
//! other in-flight requests on the same connection.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use honeypot_core::types::TargetSystemId;
use honeypot_protocol::{Frame, FrameCodec, Message};

use crate::sandbox::SandboxError;
use crate::state::OrchestratorState;

/// Accept loop for the provider RPC listener. Races `accept()` against
/// `cancel` so shutdown can stop it between accepts, matching the frontend's
/// Session Manager accept loop.
pub async fn run(
    state: Arc<OrchestratorState>,
    bind_addr: &str,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "provider rpc listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("provider rpc accept loop stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let state = state.clone();
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            tracing::debug!(%peer_addr, "provider rpc connection accepted");
                            handle_connection(state, stream, conn_cancel).await;
                            tracing::debug!(%peer_addr, "provider rpc connection closed");
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "provider rpc accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(state: Arc<OrchestratorState>, stream: TcpStream, cancel: CancellationToken) {
    let framed = Framed::new(stream, FrameCodec::new());
    let (sink, mut incoming) = framed.split();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(run_writer(sink, reply_rx));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = incoming.next() => {
                match frame {
                    Some(Ok(frame)) => {
                        let state = state.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            handle_request(state, frame, reply_tx).await;
                        });
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "provider rpc read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    drop(reply_tx);
    let _ = writer.await;
}

async fn run_writer(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, FrameCodec>, Frame>,
    mut replies: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = replies.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::warn!(error = %e, "provider rpc write failed");
            break;
        }
    }
}

/// Handle one request frame, sending its reply (or reply stream, for
/// `Yield`) back through `reply_tx` tagged with the same request id.
async fn handle_request(state: Arc<OrchestratorState>, frame: Frame, reply_tx: mpsc::UnboundedSender<Frame>) {
    let request_id = frame.request_id;

    match frame.message {
        Message::AcquireTargetSystem { user, password } => {
            let reply = match state.sandboxes.acquire(&user, &password).await {
                Ok(record) => Message::TargetSystemAcquired {
                    id: record.id.as_u32().to_string(),
                    address: state.config.target_system_address.clone(),
                    port: record.host_port,
                },
                Err(SandboxError::CapacityExceeded(limit)) => {
                    tracing::info!(limit, "acquire rejected: at capacity");
                    Message::TargetSystemUnavailable
                }
                Err(err) => {
                    tracing::warn!(error = %err, "acquire failed");
                    Message::ProviderError { message: err.to_string() }
                }
            };
            let _ = reply_tx.send(Frame::new(request_id, reply));
        }
        Message::YieldTargetSystem { id } => {
            let Ok(raw_id) = id.parse::<u32>() else {
                let _ = reply_tx.send(Frame::new(request_id, Message::YieldNotFound));
                return;
            };
            let target_id = TargetSystemId::new(raw_id);

            match state.sandboxes.yield_target_system(target_id).await {
                Ok(events) => {
                    for event in events {
                        let _ = reply_tx.send(Frame::new(request_id, Message::YieldEvent { event }));
                    }
                    let _ = reply_tx.send(Frame::new(request_id, Message::YieldComplete));
                }
                Err(SandboxError::NotFound(_)) => {
                    let _ = reply_tx.send(Frame::new(request_id, Message::YieldNotFound));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "yield failed");
                    let _ = reply_tx.send(Frame::new(request_id, Message::ProviderError { message: err.to_string() }));
                }
            }
        }
        other => {
            tracing::warn!(?other, "unexpected message from frontend");
            let _ = reply_tx.send(Frame::new(
                request_id,
                Message::ProviderError {
                    message: "unexpected message type".to_string(),
                },
            ));
        }
    }
}
