//! Full-duplex link to the remote speech service
//!
//! One writer task serializes outbound frames from a bounded channel (the
//! channel is the back-pressure boundary for audio upload); one reader
//! task demultiplexes inbound frames by `type` and forwards them to typed
//! channels, one per downstream consumer:
//!
//! - transcription events → text path
//! - response lifecycle (`created`/`done`/`error`) → scheduler
//! - translated text/audio deltas → voice path
//!
//! On socket close the reader drops every route sender and trips the
//! `closed` token; downstream tasks observe closed channels at their next
//! receive. Reconnection is the host's business, not this module's.

pub mod protocol;

use crate::error::{LinkError, Result};
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientEvent, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound channel depth; writer back-pressure stalls upload, never capture
const OUTBOUND_DEPTH: usize = 64;
/// Route channel depth per consumer
const ROUTE_DEPTH: usize = 256;

/// Sender side of the link, cloneable across producer tasks.
#[derive(Clone)]
pub struct LinkHandle {
    outbound: mpsc::Sender<ClientEvent>,
    closed: CancellationToken,
}

impl LinkHandle {
    /// Queue an outbound frame, applying writer back-pressure.
    pub async fn send(&self, event: ClientEvent) -> Result<()> {
        self.outbound
            .send(event)
            .await
            .map_err(|_| LinkError::Closed.into())
    }

    /// Token tripped when the socket goes away
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the link has been torn down
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Typed inbound routes, one receiver per consumer task.
pub struct LinkRoutes {
    /// `conversation.item.input_audio_transcription.completed`
    pub transcripts: mpsc::Receiver<ServerEvent>,
    /// `response.created` / `response.done` / `error`
    pub responses: mpsc::Receiver<ServerEvent>,
    /// `response.audio.delta|done` / `response.audio_transcript.delta|done`
    pub deltas: mpsc::Receiver<ServerEvent>,
}

struct RouteSenders {
    transcripts: mpsc::Sender<ServerEvent>,
    responses: mpsc::Sender<ServerEvent>,
    deltas: mpsc::Sender<ServerEvent>,
}

impl RouteSenders {
    fn new() -> (Self, LinkRoutes) {
        let (transcripts_tx, transcripts) = mpsc::channel(ROUTE_DEPTH);
        let (responses_tx, responses) = mpsc::channel(ROUTE_DEPTH);
        let (deltas_tx, deltas) = mpsc::channel(ROUTE_DEPTH);
        (
            Self {
                transcripts: transcripts_tx,
                responses: responses_tx,
                deltas: deltas_tx,
            },
            LinkRoutes {
                transcripts,
                responses,
                deltas,
            },
        )
    }

    /// Forward one parsed event to its consumer.
    async fn route(&self, event: ServerEvent) {
        let result = match &event {
            ServerEvent::TranscriptionCompleted { .. } => self.transcripts.send(event).await,
            ServerEvent::ResponseCreated { .. }
            | ServerEvent::ResponseDone { .. }
            | ServerEvent::Error { .. } => self.responses.send(event).await,
            ServerEvent::AudioTranscriptDelta { .. }
            | ServerEvent::AudioTranscriptDone { .. }
            | ServerEvent::AudioDelta { .. }
            | ServerEvent::AudioDone { .. } => self.deltas.send(event).await,
            ServerEvent::Unknown => {
                debug!("Ignoring unconsumed server message type");
                return;
            }
        };
        if result.is_err() {
            debug!("Route consumer gone; dropping inbound event");
        }
    }
}

/// Connect to the remote service and spawn the reader/writer tasks.
///
/// Fails with [`LinkError::Refused`] when the socket cannot be opened;
/// the caller maps that to its session-start exit path.
pub async fn connect(url: &str, auth_token: &str) -> Result<(LinkHandle, LinkRoutes)> {
    let mut request = url
        .into_client_request()
        .map_err(|e| LinkError::Refused(format!("bad url: {e}")))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {auth_token}")
            .parse()
            .map_err(|_| LinkError::Refused("invalid auth token".into()))?,
    );

    let (socket, _) = connect_async(request)
        .await
        .map_err(|e| LinkError::Refused(e.to_string()))?;
    info!("Connected to remote speech service");

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientEvent>(OUTBOUND_DEPTH);
    let (senders, routes) = RouteSenders::new();
    let closed = CancellationToken::new();

    // Writer: outbound channel → socket
    let writer_closed = closed.clone();
    tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to serialize outbound frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text)).await {
                warn!("Socket write failed: {}", e);
                writer_closed.cancel();
                break;
            }
        }
        debug!("Link writer exiting");
    });

    // Reader: socket → demux
    let reader_closed = closed.clone();
    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => senders.route(event).await,
                    Err(e) => warn!("Malformed inbound frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Remote closed the socket");
                    break;
                }
                Ok(_) => {} // ping/pong/binary handled by the library
                Err(e) => {
                    warn!("Socket read failed: {}", e);
                    break;
                }
            }
        }
        // Dropping `senders` closes every route; consumers see the end
        // of their channel and fail in-flight segments with link_closed.
        reader_closed.cancel();
        debug!("Link reader exiting");
    });

    Ok((
        LinkHandle {
            outbound: outbound_tx,
            closed,
        },
        routes,
    ))
}

/// In-process link for tests and headless integration: the "service" is
/// whatever task holds the [`ServiceEndpoint`].
pub fn in_process() -> (LinkHandle, LinkRoutes, ServiceEndpoint) {
    let (outbound_tx, outbound_rx) = mpsc::channel::<ClientEvent>(OUTBOUND_DEPTH);
    let (inject_tx, mut inject_rx) = mpsc::channel::<ServerEvent>(ROUTE_DEPTH);
    let (senders, routes) = RouteSenders::new();
    let closed = CancellationToken::new();

    let reader_closed = closed.clone();
    tokio::spawn(async move {
        while let Some(event) = inject_rx.recv().await {
            senders.route(event).await;
        }
        reader_closed.cancel();
    });

    (
        LinkHandle {
            outbound: outbound_tx,
            closed,
        },
        routes,
        ServiceEndpoint {
            sent: outbound_rx,
            inject: inject_tx,
        },
    )
}

/// The far side of an in-process link.
pub struct ServiceEndpoint {
    /// Frames the client sent, in order
    pub sent: mpsc::Receiver<ClientEvent>,
    /// Inject service → client events through the demux
    pub inject: mpsc::Sender<ServerEvent>,
}
