//! Voice path: response creation and translated-media consumption
//!
//! For each segment, in order: wait on the upload barrier, hand a
//! response request to the scheduler (waiting out its busy window; the
//! single-active-response invariant is the scheduler's, not ours), then
//! consume translated text deltas and audio deltas until the response's
//! terminal event resolves the request. Audio deltas become playback
//! chunks, sequence-numbered in arrival order.

use crate::error::SegmentError;
use crate::link::protocol::ServerEvent;
use crate::playback::{PlaybackChunk, PlaybackHandle};
use crate::queue::{PathCompletion, PathKind, SegmentQueueHandle, VoiceOutcome};
use crate::scheduler::{EnqueueError, ResponseRequest, SchedulerHandle};
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Session-scoped request template for the voice path
#[derive(Debug, Clone)]
pub struct VoicePathConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    /// Mirrors PLAYBACK_ENABLED for the result envelope
    pub playback_enabled: bool,
}

/// Run the voice-path worker until the session ends.
pub async fn run_voice_path(
    queue: SegmentQueueHandle,
    scheduler: SchedulerHandle,
    mut deltas: mpsc::Receiver<ServerEvent>,
    playback: PlaybackHandle,
    config: VoicePathConfig,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = queue.next_job(PathKind::Voice) => job,
            _ = cancel.cancelled() => break,
        };
        let Some(segment) = job else { break };
        let id = segment.id;

        // Deltas from a previous response must not leak into this one
        while deltas.try_recv().is_ok() {
            debug!("Discarding stale delta before segment {}", id);
        }

        // Barrier: never issue the request before this segment's audio
        // is committed on the wire.
        if let Err(e) = queue.wait_uploaded(id).await {
            debug!("Segment {} barrier released with {:?}", id, e);
            queue
                .mark_path_complete(id, PathCompletion::Voice(Err(e)))
                .await;
            continue;
        }

        // Enqueue, waiting out the scheduler's busy window
        let request = ResponseRequest {
            segment_id: id,
            modalities: config.modalities.clone(),
            instructions: config.instructions.clone(),
        };
        let completion = loop {
            match scheduler.enqueue(request.clone()).await {
                Ok(completion) => break Ok(completion),
                Err(EnqueueError::Busy) => {
                    tokio::select! {
                        _ = scheduler.wait_idle() => {}
                        _ = cancel.cancelled() => break Err(SegmentError::Cancelled),
                    }
                }
                Err(EnqueueError::Closed) => break Err(SegmentError::LinkClosed),
            }
        };
        let mut completion = match completion {
            Ok(completion) => completion,
            Err(e) => {
                queue
                    .mark_path_complete(id, PathCompletion::Voice(Err(e)))
                    .await;
                continue;
            }
        };

        // Consume media until the response resolves
        let mut translated = String::new();
        let mut chunks: u32 = 0;
        let mut response_id: Option<String> = None;

        let outcome = loop {
            tokio::select! {
                resolved = &mut completion => {
                    match resolved {
                        Ok(Ok(done)) => {
                            // Late deltas already routed are consumed below
                            drain_deltas(
                                &mut deltas,
                                &playback,
                                &mut translated,
                                &mut chunks,
                                &done.response_id,
                            );
                            response_id = Some(done.response_id);
                            break Ok(());
                        }
                        Ok(Err(e)) => break Err(e),
                        Err(_) => break Err(SegmentError::Cancelled),
                    }
                }
                event = deltas.recv() => match event {
                    Some(event) => consume_delta(
                        event,
                        &playback,
                        &mut translated,
                        &mut chunks,
                        &mut response_id,
                    ),
                    None => break Err(SegmentError::LinkClosed),
                },
                _ = cancel.cancelled() => break Err(SegmentError::Cancelled),
            }
        };

        let result = match outcome {
            Ok(()) => {
                if translated.is_empty() && chunks == 0 {
                    Err(SegmentError::EmptyResult)
                } else {
                    Ok(VoiceOutcome {
                        translated_text: translated,
                        audio_chunks: chunks,
                        audio_played: config.playback_enabled && chunks > 0,
                    })
                }
            }
            Err(e) => {
                // Whatever was queued for this response will not be heard
                if let Some(response_id) = response_id.as_deref() {
                    playback.clear_for_response(response_id);
                }
                warn!("Segment {} voice path failed: {:?}", id, e);
                Err(e)
            }
        };
        queue
            .mark_path_complete(id, PathCompletion::Voice(result))
            .await;
    }
    debug!("Voice path worker exiting");
}

/// Handle one inbound delta event.
fn consume_delta(
    event: ServerEvent,
    playback: &PlaybackHandle,
    translated: &mut String,
    chunks: &mut u32,
    response_id: &mut Option<String>,
) {
    match event {
        ServerEvent::AudioTranscriptDelta { response_id: rid, delta } => {
            if response_id.is_none() {
                *response_id = rid;
            }
            translated.push_str(&delta);
        }
        ServerEvent::AudioTranscriptDone { transcript, .. } => {
            // The done event carries the authoritative full text
            if let Some(full) = transcript {
                *translated = full;
            }
        }
        ServerEvent::AudioDelta { response_id: rid, delta } => {
            let rid = match (&rid, &response_id) {
                (Some(rid), _) => rid.clone(),
                (None, Some(known)) => known.clone(),
                (None, None) => String::new(),
            };
            if response_id.is_none() && !rid.is_empty() {
                *response_id = Some(rid.clone());
            }
            match base64::engine::general_purpose::STANDARD.decode(delta.as_bytes()) {
                Ok(pcm) if !pcm.is_empty() => {
                    playback.enqueue(PlaybackChunk {
                        response_id: rid,
                        sequence: *chunks,
                        pcm,
                    });
                    *chunks += 1;
                }
                Ok(_) => debug!("Zero-byte audio delta ignored"),
                Err(e) => warn!("Undecodable audio delta: {}", e),
            }
        }
        ServerEvent::AudioDone { .. } => {}
        other => debug!("Voice path ignoring event: {other:?}"),
    }
}

/// Non-blocking drain of deltas that raced the terminal event.
fn drain_deltas(
    deltas: &mut mpsc::Receiver<ServerEvent>,
    playback: &PlaybackHandle,
    translated: &mut String,
    chunks: &mut u32,
    response_id: &str,
) {
    let mut bound = Some(response_id.to_string());
    while let Ok(event) = deltas.try_recv() {
        consume_delta(event, playback, translated, chunks, &mut bound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::link::protocol::{ClientEvent, ResponseRef};
    use crate::playback::{NullSink, PlaybackQueue};
    use crate::queue;
    use crate::scheduler::{self, SchedulerConfig};
    use crate::segment::Segment;
    use base64::Engine as _;
    use std::sync::Arc;
    use std::time::Duration;

    fn segment(id: u64) -> Arc<Segment> {
        Arc::new(Segment {
            id,
            start_ns: 0,
            end_ns: 1,
            samples: vec![100i16; 24_000],
            source_lang: None,
        })
    }

    fn config() -> VoicePathConfig {
        VoicePathConfig {
            modalities: vec!["text".into(), "audio".into()],
            instructions: "translate".into(),
            playback_enabled: true,
        }
    }

    #[tokio::test]
    async fn test_barrier_gates_response_create() {
        let (queue_handle, _released) = queue::spawn(4);
        let (link_handle, routes, mut service) = link::in_process();
        let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());
        let playback = PlaybackQueue::spawn(Box::new(NullSink), None, 1.0, true).unwrap();
        let cancel = CancellationToken::new();

        tokio::spawn(run_voice_path(
            queue_handle.clone(),
            sched,
            routes.deltas,
            playback.handle(),
            config(),
            cancel.clone(),
        ));

        queue_handle.enqueue(segment(1)).await;

        // Nothing must reach the wire before the upload barrier opens
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            service.sent.try_recv().is_err(),
            "response.create before audio_uploaded"
        );

        queue_handle.mark_uploaded(1).await;
        match tokio::time::timeout(Duration::from_secs(1), service.sent.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ClientEvent::ResponseCreate { response } => {
                assert_eq!(response.modalities, vec!["text", "audio"]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_response_flow() {
        let (queue_handle, mut released) = queue::spawn(4);
        let (link_handle, routes, mut service) = link::in_process();
        let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());
        let playback = PlaybackQueue::spawn(Box::new(NullSink), None, 1.0, true).unwrap();
        let playback_handle = playback.handle();
        let cancel = CancellationToken::new();

        tokio::spawn(run_voice_path(
            queue_handle.clone(),
            sched,
            routes.deltas,
            playback_handle.clone(),
            config(),
            cancel.clone(),
        ));

        queue_handle.enqueue(segment(1)).await;
        queue_handle.mark_uploaded(1).await;

        // Wait for the create, then stream a response
        loop {
            if let ClientEvent::ResponseCreate { .. } = service.sent.recv().await.unwrap() {
                break;
            }
        }
        let inject = &service.inject;
        inject
            .send(ServerEvent::ResponseCreated {
                response: ResponseRef { id: "r1".into() },
            })
            .await
            .unwrap();
        inject
            .send(ServerEvent::AudioTranscriptDelta {
                response_id: Some("r1".into()),
                delta: "Hal".into(),
            })
            .await
            .unwrap();
        inject
            .send(ServerEvent::AudioTranscriptDelta {
                response_id: Some("r1".into()),
                delta: "lo".into(),
            })
            .await
            .unwrap();
        inject
            .send(ServerEvent::AudioDelta {
                response_id: Some("r1".into()),
                delta: base64::engine::general_purpose::STANDARD.encode([0u8, 1, 2, 3]),
            })
            .await
            .unwrap();
        inject
            .send(ServerEvent::ResponseDone {
                response: ResponseRef { id: "r1".into() },
            })
            .await
            .unwrap();

        // Complete the text half so the segment releases
        queue_handle
            .mark_path_complete(
                1,
                PathCompletion::Text(Err(SegmentError::Cancelled)),
            )
            .await;

        let done = released.recv().await.unwrap();
        let voice = done.voice.unwrap();
        assert_eq!(voice.translated_text, "Hallo");
        assert_eq!(voice.audio_chunks, 1);
        assert!(voice.audio_played);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_empty_response_is_validation_error() {
        let (queue_handle, mut released) = queue::spawn(4);
        let (link_handle, routes, mut service) = link::in_process();
        let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());
        let playback = PlaybackQueue::spawn(Box::new(NullSink), None, 1.0, true).unwrap();
        let cancel = CancellationToken::new();

        tokio::spawn(run_voice_path(
            queue_handle.clone(),
            sched,
            routes.deltas,
            playback.handle(),
            config(),
            cancel.clone(),
        ));

        queue_handle.enqueue(segment(1)).await;
        queue_handle.mark_uploaded(1).await;
        loop {
            if let ClientEvent::ResponseCreate { .. } = service.sent.recv().await.unwrap() {
                break;
            }
        }
        // Terminal event with no media at all
        service
            .inject
            .send(ServerEvent::ResponseDone {
                response: ResponseRef { id: "r9".into() },
            })
            .await
            .unwrap();
        queue_handle
            .mark_path_complete(1, PathCompletion::Text(Err(SegmentError::Cancelled)))
            .await;

        let done = released.recv().await.unwrap();
        assert_eq!(done.voice.unwrap_err(), SegmentError::EmptyResult);
        cancel.cancel();
    }
}
