//! Provider RPC client
//!
//! Thin client for the target-system provider RPC spoken with the sandbox
//! orchestrator. A single instance is shared across every proxy handler in
//! the process: the wire protocol tags every frame with a [`RequestId`], so
//! one TCP connection can multiplex concurrent acquire/yield calls from
//! unrelated attacker sessions without head-of-line blocking between them.
//!
//! The connection is owned by a single background task (an actor): callers
//! never touch the socket directly, they send a `Frame` plus a reply sink
//! over an mpsc channel and await their half of it. This sidesteps sharing
//! a split read/write pair behind a lock and gives the actor a natural place
//! to reconnect with backoff when the orchestrator connection drops.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use honeypot_core::config::BackoffConfig;
use honeypot_core::types::TargetSystemId;
use honeypot_core::ExponentialBackoff;
use honeypot_protocol::{DownloadEvent, Frame, FrameCodec, Message, RequestId, RequestIdGenerator};

#[derive(Debug, Clone)]
pub struct AcquiredTargetSystem {
    pub id: TargetSystemId,
    pub address: String,
    pub port: u32,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no target system is currently available")]
    Unavailable,
    #[error("target system {0} was not recognized by the provider")]
    NotFound(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("wire protocol error: {0}")]
    Protocol(#[from] honeypot_protocol::ProtocolError),
    #[error("provider connection closed unexpectedly")]
    ConnectionClosed,
}

/// Where replies for one in-flight request are delivered.
enum ReplySink {
    /// `Acquire` completes with exactly one reply.
    Once(oneshot::Sender<Message>),
    /// `Yield` streams zero or more `YieldEvent`s, terminated by
    /// `YieldComplete`/`YieldNotFound`/`ProviderError`.
    Stream(mpsc::UnboundedSender<Message>),
}

enum ActorCommand {
    Send { frame: Frame, reply: ReplySink },
}

/// Client for the provider RPC. Cheap to clone; every clone shares the same
/// background connection actor.
#[derive(Clone)]
pub struct ProviderClient {
    ids: std::sync::Arc<RequestIdGenerator>,
    commands: mpsc::Sender<ActorCommand>,
}

impl ProviderClient {
    /// Spawn the connection actor and return a handle to it.
    pub fn connect(backend_address: String, backoff: BackoffConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(256);

        tokio::spawn(run_actor(backend_address, backoff, commands_rx));

        Self {
            ids: std::sync::Arc::new(RequestIdGenerator::new()),
            commands: commands_tx,
        }
    }

    pub async fn acquire_target_system(
        &self,
        user: String,
        password: String,
    ) -> Result<AcquiredTargetSystem, ProviderError> {
        let request_id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();

        self.commands
            .send(ActorCommand::Send {
                frame: Frame::new(request_id, Message::AcquireTargetSystem { user, password }),
                reply: ReplySink::Once(tx),
            })
            .await
            .map_err(|_| ProviderError::ConnectionClosed)?;

        let reply = tokio::time::timeout(Duration::from_secs(30), rx)
            .await
            .map_err(|_| ProviderError::ConnectionClosed)?
            .map_err(|_| ProviderError::ConnectionClosed)?;

        match reply {
            Message::TargetSystemAcquired { id, address, port } => Ok(AcquiredTargetSystem {
                id: TargetSystemId::new(id.parse().unwrap_or_default()),
                address,
                port,
            }),
            Message::TargetSystemUnavailable => Err(ProviderError::Unavailable),
            Message::ProviderError { message } => Err(ProviderError::Provider(message)),
            other => Err(ProviderError::Provider(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn yield_target_system(
        &self,
        id: TargetSystemId,
    ) -> Result<Vec<DownloadEvent>, ProviderError> {
        let request_id = self.ids.next_id();
        let (tx, mut rx) = mpsc::unbounded_channel();

        self.commands
            .send(ActorCommand::Send {
                frame: Frame::new(request_id, Message::YieldTargetSystem { id: id.as_u32().to_string() }),
                reply: ReplySink::Stream(tx),
            })
            .await
            .map_err(|_| ProviderError::ConnectionClosed)?;

        let mut events = Vec::new();
        while let Some(message) = rx.recv().await {
            match message {
                Message::YieldEvent { event } => events.push(event),
                Message::YieldComplete => return Ok(events),
                Message::YieldNotFound => return Err(ProviderError::NotFound(id.to_string())),
                Message::ProviderError { message } => return Err(ProviderError::Provider(message)),
                other => tracing::warn!(?other, "unexpected message in yield stream"),
            }
        }

        Err(ProviderError::ConnectionClosed)
    }
}

/// Owns the orchestrator TCP connection for the lifetime of the process,
/// reconnecting with backoff whenever it drops. Pending requests from a
/// connection that dropped are simply abandoned: their reply sinks are
/// dropped, which surfaces as `ConnectionClosed` to the waiting caller.
async fn run_actor(
    backend_address: String,
    backoff_config: BackoffConfig,
    mut commands: mpsc::Receiver<ActorCommand>,
) {
    'reconnect: loop {
        let mut backoff = ExponentialBackoff::from_config(&backoff_config);
        let stream = loop {
            match TcpStream::connect(&backend_address).await {
                Ok(stream) => break stream,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, backend = %backend_address, retry_in = ?delay, "provider connect failed");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        tracing::info!(backend = %backend_address, "connected to provider");
        let mut framed = Framed::new(stream, FrameCodec::new());
        let mut pending: HashMap<RequestId, ReplySink> = HashMap::new();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(ActorCommand::Send { frame, reply }) = command else {
                        return; // every client handle dropped
                    };
                    let request_id = frame.request_id;
                    if let Err(e) = framed.send(frame).await {
                        tracing::warn!(error = %e, "provider write failed, reconnecting");
                        continue 'reconnect;
                    }
                    pending.insert(request_id, reply);
                }
                incoming = framed.next() => {
                    match incoming {
                        Some(Ok(frame)) => dispatch_reply(&mut pending, frame),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "provider read failed, reconnecting");
                            continue 'reconnect;
                        }
                        None => {
                            tracing::warn!("provider connection closed, reconnecting");
                            continue 'reconnect;
                        }
                    }
                }
            }
        }
    }
}

fn dispatch_reply(pending: &mut HashMap<RequestId, ReplySink>, frame: Frame) {
    let is_terminal = !matches!(frame.message, Message::YieldEvent { .. });

    match pending.get(&frame.request_id) {
        Some(ReplySink::Once(_)) => {
            if let Some(ReplySink::Once(tx)) = pending.remove(&frame.request_id) {
                let _ = tx.send(frame.message);
            }
        }
        Some(ReplySink::Stream(tx)) => {
            let _ = tx.send(frame.message);
            if is_terminal {
                pending.remove(&frame.request_id);
            }
        }
        None => {
            tracing::warn!(request_id = %frame.request_id, "reply for unknown/already-completed request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquired_target_system_is_clonable() {
        let t = AcquiredTargetSystem {
            id: TargetSystemId::new(1),
            address: "10.0.0.5".into(),
            port: 2222,
        };
        let cloned = t.clone();
        assert_eq!(cloned.port, 2222);
    }

    #[test]
    fn test_dispatch_reply_removes_once_sink_after_delivery() {
        let (tx, _rx) = oneshot::channel();
        let mut pending = HashMap::new();
        pending.insert(RequestId::new(1), ReplySink::Once(tx));

        dispatch_reply(
            &mut pending,
            Frame::new(RequestId::new(1), Message::TargetSystemUnavailable),
        );

        assert!(pending.is_empty());
    }

    #[test]
    fn test_dispatch_reply_keeps_stream_sink_until_terminal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = HashMap::new();
        pending.insert(RequestId::new(1), ReplySink::Stream(tx));

        dispatch_reply(
            &mut pending,
            Frame::new(
                RequestId::new(1),
                Message::YieldEvent {
                    event: DownloadEvent {
                        timestamp_millis: 0,
                        source_address: honeypot_protocol::SourceAddress::V4(
                            std::net::Ipv4Addr::LOCALHOST,
                        ),
                        url: None,
                        mime_type: "application/octet-stream".into(),
                        data: vec![],
                    },
                },
            ),
        );
        assert!(pending.contains_key(&RequestId::new(1)));
        assert!(rx.try_recv().is_ok());

        dispatch_reply(
            &mut pending,
            Frame::new(RequestId::new(1), Message::YieldComplete),
        );
        assert!(pending.is_empty());
    }
}
