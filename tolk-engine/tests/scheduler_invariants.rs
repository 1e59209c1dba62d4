//! Scheduler invariant tests against a scripted remote peer
//!
//! Drives the scheduler over an in-process link and asserts the
//! single-active-response invariant, enqueue-order transmission, timeout
//! retry behavior, and soft-conflict tolerance at the wire level.

use std::time::Duration;
use tolk_engine::error::SegmentError;
use tolk_engine::link::protocol::{ClientEvent, ResponseRef, ServerEvent};
use tolk_engine::link::{self, ServiceEndpoint};
use tolk_engine::scheduler::{self, EnqueueError, ResponseRequest, SchedulerConfig};

fn request(segment_id: u64) -> ResponseRequest {
    ResponseRequest {
        segment_id,
        modalities: vec!["text".into(), "audio".into()],
        instructions: "translate".into(),
    }
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        request_timeout: Duration::from_millis(100),
        max_retries: 2,
        backoff_base: Duration::from_millis(10),
    }
}

async fn recv_create(service: &mut ServiceEndpoint) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), service.sent.recv())
        .await
        .expect("frame within window")
        .expect("link open")
}

async fn inject(service: &ServiceEndpoint, event: ServerEvent) {
    service.inject.send(event).await.unwrap();
}

fn created(id: &str) -> ServerEvent {
    ServerEvent::ResponseCreated {
        response: ResponseRef { id: id.into() },
    }
}

fn done(id: &str) -> ServerEvent {
    ServerEvent::ResponseDone {
        response: ResponseRef { id: id.into() },
    }
}

fn conflict() -> ServerEvent {
    ServerEvent::Error {
        code: Some("conversation_already_has_active_response".into()),
        message: "busy".into(),
    }
}

#[tokio::test]
async fn test_single_request_completes() {
    let (link_handle, routes, mut service) = link::in_process();
    let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());

    let completion = sched.enqueue(request(1)).await.unwrap();
    assert!(matches!(
        recv_create(&mut service).await,
        ClientEvent::ResponseCreate { .. }
    ));

    inject(&service, created("r1")).await;
    inject(&service, done("r1")).await;

    let resolved = completion.await.unwrap().unwrap();
    assert_eq!(resolved.response_id, "r1");
}

#[tokio::test]
async fn test_busy_while_in_flight() {
    let (link_handle, routes, mut service) = link::in_process();
    let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());

    let completion = sched.enqueue(request(1)).await.unwrap();
    let _ = recv_create(&mut service).await;

    // The slot is taken: immediate rejection, no second frame
    assert_eq!(sched.enqueue(request(2)).await.unwrap_err(), EnqueueError::Busy);
    assert!(service.sent.try_recv().is_err());

    inject(&service, created("r1")).await;
    inject(&service, done("r1")).await;
    completion.await.unwrap().unwrap();

    // Done unblocks the next enqueue
    sched.wait_idle().await;
    let completion2 = sched.enqueue(request(2)).await.unwrap();
    let _ = recv_create(&mut service).await;
    inject(&service, created("r2")).await;
    inject(&service, done("r2")).await;
    assert_eq!(completion2.await.unwrap().unwrap().response_id, "r2");
}

#[tokio::test]
async fn test_never_more_than_one_create_outstanding() {
    let (link_handle, routes, mut service) = link::in_process();
    let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());

    // Interleave enqueues and completions in a busy-waiting producer the
    // way the voice path does, and watch the wire from the service side.
    let producer = tokio::spawn({
        let sched = sched.clone();
        async move {
            for id in 1..=5u64 {
                loop {
                    match sched.enqueue(request(id)).await {
                        Ok(completion) => {
                            completion.await.unwrap().unwrap();
                            break;
                        }
                        Err(EnqueueError::Busy) => sched.wait_idle().await,
                        Err(EnqueueError::Closed) => panic!("scheduler closed"),
                    }
                }
            }
        }
    });

    for n in 1..=5u64 {
        let frame = recv_create(&mut service).await;
        assert!(matches!(frame, ClientEvent::ResponseCreate { .. }));

        // While this response is unfinished, no further create may appear
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(
            service.sent.try_recv().is_err(),
            "second response.create while response {n} outstanding"
        );

        let id = format!("r{n}");
        inject(&service, created(&id)).await;
        inject(&service, done(&id)).await;
    }

    producer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_retries_then_fails_segment() {
    let (link_handle, routes, mut service) = link::in_process();
    let sched = scheduler::spawn(link_handle, routes.responses, fast_config());

    let completion = sched.enqueue(request(1)).await.unwrap();

    // Initial attempt plus exactly two retries, never a fourth frame
    for _ in 0..3 {
        assert!(matches!(
            recv_create(&mut service).await,
            ClientEvent::ResponseCreate { .. }
        ));
    }
    let resolved = completion.await.unwrap();
    assert_eq!(resolved.unwrap_err(), SegmentError::Timeout);
    assert!(service.sent.try_recv().is_err(), "retry storm after exhaustion");
    let stats = sched.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.completed, 0);

    // The session continues: the next request completes normally
    sched.wait_idle().await;
    let completion2 = sched.enqueue(request(2)).await.unwrap();
    let _ = recv_create(&mut service).await;
    inject(&service, created("r2")).await;
    inject(&service, done("r2")).await;
    assert_eq!(completion2.await.unwrap().unwrap().response_id, "r2");
    assert_eq!(sched.stats().completed, 1);
}

#[tokio::test]
async fn test_soft_conflict_is_not_retried() {
    let (link_handle, routes, mut service) = link::in_process();
    let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());

    // First request completes normally
    let completion1 = sched.enqueue(request(1)).await.unwrap();
    let _ = recv_create(&mut service).await;
    inject(&service, created("r1")).await;
    inject(&service, done("r1")).await;
    completion1.await.unwrap().unwrap();

    // Second request is rejected by the peer as overlapping
    sched.wait_idle().await;
    let completion2 = sched.enqueue(request(2)).await.unwrap();
    let _ = recv_create(&mut service).await;
    inject(&service, conflict()).await;

    let resolved = completion2.await.unwrap();
    assert_eq!(resolved.unwrap_err(), SegmentError::SoftConflict);

    // Zero retries for this code
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(service.sent.try_recv().is_err(), "soft conflict fired a retry");
    let stats = sched.stats();
    assert_eq!(stats.soft_conflicts, 1);
    assert_eq!(stats.retries, 0);

    // The prior response's terminal event re-drives the queue; the third
    // request then proceeds normally.
    inject(&service, done("r_prior")).await;
    sched.wait_idle().await;
    let completion3 = sched.enqueue(request(3)).await.unwrap();
    let _ = recv_create(&mut service).await;
    inject(&service, created("r3")).await;
    inject(&service, done("r3")).await;
    assert_eq!(completion3.await.unwrap().unwrap().response_id, "r3");
    assert_eq!(sched.stats().completed, 2);
}

#[tokio::test]
async fn test_clear_rejects_everything_with_cancelled() {
    let (link_handle, routes, mut service) = link::in_process();
    let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());

    let completion = sched.enqueue(request(1)).await.unwrap();
    let _ = recv_create(&mut service).await;

    sched.clear().await;
    assert_eq!(completion.await.unwrap().unwrap_err(), SegmentError::Cancelled);
}

#[tokio::test]
async fn test_link_closure_fails_in_flight_with_link_closed() {
    let (link_handle, routes, mut service) = link::in_process();
    let sched = scheduler::spawn(link_handle, routes.responses, SchedulerConfig::default());

    let completion = sched.enqueue(request(1)).await.unwrap();
    let _ = recv_create(&mut service).await;

    drop(service);
    assert_eq!(
        completion.await.unwrap().unwrap_err(),
        SegmentError::LinkClosed
    );

    // The scheduler is gone; later enqueues observe closure
    assert_eq!(
        sched.enqueue(request(2)).await.unwrap_err(),
        EnqueueError::Closed
    );
}
