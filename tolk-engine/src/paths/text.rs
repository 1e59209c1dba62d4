//! Text path: audio upload and source transcript
//!
//! For each segment, in order: stream the utterance as base64 PCM16
//! append frames (4800 samples, 200 ms, per frame), commit, open the
//! upload barrier for the voice path, then wait for the transcription
//! event. The detected script of the transcript overrides any preset
//! source language.

use crate::error::SegmentError;
use crate::link::protocol::{ClientEvent, ServerEvent};
use crate::link::LinkHandle;
use crate::queue::{PathCompletion, PathKind, SegmentQueueHandle, TextOutcome};
use crate::scheduler::ResponsePhase;
use base64::Engine as _;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Samples per append frame: 200 ms at 24 kHz
pub const UPLOAD_CHUNK_SAMPLES: usize = 4800;

/// Default transcript wait window
pub const TRANSCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the text-path worker until the session ends.
pub async fn run_text_path(
    queue: SegmentQueueHandle,
    link: LinkHandle,
    mut transcripts: mpsc::Receiver<ServerEvent>,
    transcript_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            job = queue.next_job(PathKind::Text) => job,
            _ = cancel.cancelled() => break,
        };
        let Some(segment) = job else { break };
        let id = segment.id;

        // Stale transcription events from an earlier timed-out segment
        // must not satisfy this segment's wait.
        while transcripts.try_recv().is_ok() {
            debug!("Discarding stale transcription event before segment {}", id);
        }

        // Upload with the response lifecycle tracked per request
        let mut phase = ResponsePhase::Idle
            .advance(ResponsePhase::AudioBuffering)
            .expect("legal transition");

        let mut upload_failed = false;
        for chunk in segment.samples.chunks(UPLOAD_CHUNK_SAMPLES) {
            let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
            let audio = base64::engine::general_purpose::STANDARD.encode(bytes);
            if link.send(ClientEvent::InputAudioAppend { audio }).await.is_err() {
                upload_failed = true;
                break;
            }
        }
        if !upload_failed && link.send(ClientEvent::InputAudioCommit).await.is_err() {
            upload_failed = true;
        }

        if upload_failed {
            warn!("Segment {} upload failed: link closed", id);
            // Cancel shortcut: buffered audio never committed
            let _ = phase.advance(ResponsePhase::Idle);
            queue
                .mark_path_complete(id, PathCompletion::Text(Err(SegmentError::LinkClosed)))
                .await;
            continue;
        }

        phase = phase
            .advance(ResponsePhase::AudioCommitted)
            .expect("legal transition");
        debug!(
            "Segment {} committed ({} append frame(s))",
            id,
            segment.samples.len().div_ceil(UPLOAD_CHUNK_SAMPLES)
        );
        queue.mark_uploaded(id).await;

        // Wait for the transcript bound to this commit
        let result = tokio::select! {
            event = tokio::time::timeout(transcript_timeout, transcripts.recv()) => {
                match event {
                    Ok(Some(ServerEvent::TranscriptionCompleted { transcript })) => {
                        let trimmed = transcript.trim();
                        if trimmed.is_empty() {
                            Err(SegmentError::EmptyResult)
                        } else {
                            let language = tolk_common::detect_language(trimmed).to_string();
                            debug!("Segment {} transcript ({}): {} chars", id, language, trimmed.len());
                            Ok(TextOutcome {
                                transcript: trimmed.to_string(),
                                language,
                            })
                        }
                    }
                    Ok(Some(_)) => Err(SegmentError::EmptyResult),
                    Ok(None) => Err(SegmentError::LinkClosed),
                    Err(_) => {
                        warn!("Segment {} transcript timed out", id);
                        Err(SegmentError::Timeout)
                    }
                }
            }
            _ = cancel.cancelled() => Err(SegmentError::Cancelled),
        };

        // The request is past its committed phase either way
        let _ = phase.advance(ResponsePhase::Idle);
        queue
            .mark_path_complete(id, PathCompletion::Text(result))
            .await;
    }
    debug!("Text path worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::queue;
    use crate::segment::Segment;
    use std::sync::Arc;

    fn segment(id: u64, samples: usize) -> Arc<Segment> {
        Arc::new(Segment {
            id,
            start_ns: 0,
            end_ns: 1,
            samples: vec![1000i16; samples],
            source_lang: None,
        })
    }

    #[tokio::test]
    async fn test_upload_chunking_and_commit() {
        let (queue_handle, _released) = queue::spawn(4);
        let (link_handle, routes, mut service) = link::in_process();
        let cancel = CancellationToken::new();

        tokio::spawn(run_text_path(
            queue_handle.clone(),
            link_handle,
            routes.transcripts,
            Duration::from_secs(5),
            cancel.clone(),
        ));

        // 10800 samples → three append frames (4800/4800/1200) + commit
        queue_handle.enqueue(segment(1, 10_800)).await;

        let mut appends = 0;
        loop {
            match service.sent.recv().await.unwrap() {
                ClientEvent::InputAudioAppend { audio } => {
                    appends += 1;
                    assert!(!audio.is_empty());
                }
                ClientEvent::InputAudioCommit => break,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(appends, 3);

        // Barrier opened by the commit
        assert_eq!(queue_handle.wait_uploaded(1).await, Ok(()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_transcript_resolves_text_path() {
        let (queue_handle, mut released) = queue::spawn(4);
        let (link_handle, routes, mut service) = link::in_process();
        let cancel = CancellationToken::new();

        tokio::spawn(run_text_path(
            queue_handle.clone(),
            link_handle,
            routes.transcripts,
            Duration::from_secs(5),
            cancel.clone(),
        ));

        queue_handle.enqueue(segment(1, 4800)).await;

        // Swallow the upload, then answer with a Japanese transcript
        loop {
            if let ClientEvent::InputAudioCommit = service.sent.recv().await.unwrap() {
                break;
            }
        }
        service
            .inject
            .send(ServerEvent::TranscriptionCompleted {
                transcript: "こんにちは".into(),
            })
            .await
            .unwrap();

        // Voice path half, so the segment releases
        queue_handle
            .mark_path_complete(
                1,
                PathCompletion::Voice(Err(SegmentError::Cancelled)),
            )
            .await;

        let done = released.recv().await.unwrap();
        let text = done.text.unwrap();
        assert_eq!(text.transcript, "こんにちは");
        assert_eq!(text.language, "ja");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_empty_transcript_is_validation_error() {
        let (queue_handle, mut released) = queue::spawn(4);
        let (link_handle, routes, mut service) = link::in_process();
        let cancel = CancellationToken::new();

        tokio::spawn(run_text_path(
            queue_handle.clone(),
            link_handle,
            routes.transcripts,
            Duration::from_secs(5),
            cancel.clone(),
        ));

        queue_handle.enqueue(segment(1, 4800)).await;
        loop {
            if let ClientEvent::InputAudioCommit = service.sent.recv().await.unwrap() {
                break;
            }
        }
        service
            .inject
            .send(ServerEvent::TranscriptionCompleted {
                transcript: "   ".into(),
            })
            .await
            .unwrap();
        queue_handle
            .mark_path_complete(1, PathCompletion::Voice(Err(SegmentError::Cancelled)))
            .await;

        let done = released.recv().await.unwrap();
        assert_eq!(done.text.unwrap_err(), SegmentError::EmptyResult);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_timeout_fails_only_segment() {
        let (queue_handle, mut released) = queue::spawn(4);
        let (link_handle, routes, _service) = link::in_process();
        let cancel = CancellationToken::new();

        tokio::spawn(run_text_path(
            queue_handle.clone(),
            link_handle,
            routes.transcripts,
            Duration::from_millis(200),
            cancel.clone(),
        ));

        queue_handle.enqueue(segment(1, 4800)).await;
        queue_handle
            .mark_path_complete(1, PathCompletion::Voice(Err(SegmentError::Cancelled)))
            .await;

        let done = released.recv().await.unwrap();
        assert_eq!(done.text.unwrap_err(), SegmentError::Timeout);
        cancel.cancel();
    }
}
