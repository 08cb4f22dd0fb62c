/// End-to-end session behavior against the loopback substrate.
///
/// Completions are delivered by hand so each test controls arrival order.

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use haven_bulk::{
    AbortReason, BulkEngine, DigestVerifier, EmptyTransferPolicy, EngineConfig, EngineError,
    FileSink, LoopbackSubstrate, PatternVerifier, RequestHandle, SessionState, SessionStatus,
    SinkError, SubstrateError, TracingLogger, pattern_payload, sha256_hex,
};

use common::{assert_partition, complete_at, harness, pending_offsets};

#[test]
fn uneven_tail_refills_once_and_finalizes_on_third() {
    let h = harness(EngineConfig::default());
    let payload = pattern_payload(2500);
    let src = h.loopback.expose(payload.clone());
    let req = h.loopback.new_request();

    let id = h.engine.begin_transfer(req, src, 1000, 2).unwrap();
    assert_eq!(pending_offsets(&h.loopback), vec![0, 1000]);

    let snap = h.engine.snapshot(id).unwrap();
    assert_eq!(snap.state, SessionState::Streaming);
    assert_eq!(snap.window_depth, 2);
    assert_eq!(snap.chunks_total, 3);
    assert_eq!(snap.next_offset, 2000);

    complete_at(&h.loopback, 0);
    assert_eq!(pending_offsets(&h.loopback), vec![1000, 2000]);
    assert_eq!(h.loopback.pending_pulls()[1].1.length, 500);

    complete_at(&h.loopback, 1000);
    assert_eq!(h.engine.status(id), Some(SessionStatus::Active));
    assert_eq!(h.loopback.stats().responses_sent, 0);

    complete_at(&h.loopback, 2000);
    let (resp_req, resp) = h.loopback.responses().try_recv().unwrap();
    assert_eq!(resp_req, req);
    assert_eq!(resp.total_bytes, 2500);
    assert_eq!(resp.chunks, 3);
    assert_eq!(resp.sha256, sha256_hex(&payload));

    assert_partition(&h.sink.recorded(), 2500);
    let stats = h.loopback.stats();
    assert_eq!(stats.pulls_submitted, 3);
    assert_eq!(stats.responses_sent, 1);
    assert_eq!(stats.buffers_destroyed, 1);
    assert_eq!(stats.source_releases, 1);
    assert_eq!(stats.requests_released, 1);
    assert_eq!(h.loopback.source_refs(src), Some(0));

    assert!(matches!(h.engine.take_outcome(id), Some(SessionStatus::Completed(_))));
    assert_eq!(h.engine.take_outcome(id), None);
}

#[test]
fn single_chunk_clamps_window_to_one() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(1000));
    let req = h.loopback.new_request();

    let id = h.engine.begin_transfer(req, src, 1000, 4).unwrap();
    assert_eq!(h.engine.snapshot(id).unwrap().window_depth, 1);
    assert_eq!(pending_offsets(&h.loopback), vec![0]);

    assert_eq!(h.loopback.trigger(usize::MAX), 1);
    assert_eq!(h.loopback.stats().responses_sent, 1);
    assert!(h.engine.status(id).unwrap().is_terminal());
}

#[test]
fn requested_depth_is_capped_by_config() {
    let h = harness(EngineConfig::default().with_max_window_depth(2));
    let src = h.loopback.expose(pattern_payload(10_000));
    let req = h.loopback.new_request();

    h.engine.begin_transfer(req, src, 1000, 16).unwrap();
    assert_eq!(h.loopback.pending_pulls().len(), 2);
    h.loopback.drain();
    assert_eq!(h.loopback.stats().responses_sent, 1);
}

#[test]
fn zero_chunk_size_uses_default() {
    let h = harness(EngineConfig::default().with_default_chunk_size(4096));
    let src = h.loopback.expose(pattern_payload(10_000));
    let req = h.loopback.new_request();

    let id = h.engine.begin_transfer(req, src, 0, 4).unwrap();
    let snap = h.engine.snapshot(id).unwrap();
    assert_eq!(snap.chunk_size, 4096);
    assert_eq!(snap.chunks_total, 3);
    h.loopback.drain();
    assert_partition(&h.sink.recorded(), 10_000);
}

#[test]
fn zero_window_depth_rejected() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(10));
    let req = h.loopback.new_request();

    assert_eq!(
        h.engine.begin_transfer(req, src, 1000, 0),
        Err(EngineError::InvalidWindowDepth)
    );
    assert_eq!(h.loopback.stats().pulls_submitted, 0);
}

#[test]
fn empty_transfer_completes_immediately() {
    let h = harness(EngineConfig::default().with_empty_transfer(EmptyTransferPolicy::Complete));
    let src = h.loopback.expose(Vec::<u8>::new());
    let req = h.loopback.new_request();

    let id = h.engine.begin_transfer(req, src, 1000, 4).unwrap();

    let (_, resp) = h.loopback.responses().try_recv().unwrap();
    assert_eq!(resp.total_bytes, 0);
    assert_eq!(resp.chunks, 0);
    assert_eq!(resp.sha256, sha256_hex(&[]));

    let stats = h.loopback.stats();
    assert_eq!(stats.pulls_submitted, 0);
    assert_eq!(stats.buffers_created, 0);
    assert_eq!(stats.source_acquires, 0);
    assert_eq!(stats.requests_released, 1);
    assert!(matches!(h.engine.take_outcome(id), Some(SessionStatus::Completed(_))));
}

#[test]
fn empty_transfer_rejected() {
    let h = harness(EngineConfig::default().with_empty_transfer(EmptyTransferPolicy::Reject));
    let src = h.loopback.expose(Vec::<u8>::new());
    let req = h.loopback.new_request();

    assert_eq!(
        h.engine.begin_transfer(req, src, 1000, 4),
        Err(EngineError::EmptyTransfer)
    );
    let stats = h.loopback.stats();
    assert_eq!(stats.pulls_submitted, 0);
    assert_eq!(stats.responses_sent, 0);
    assert_eq!(stats.requests_released, 1);
    assert!(!h.loopback.is_request_live(req));
}

#[test]
fn prime_submission_failure_aborts_and_releases_after_drain() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(3000));
    let req = h.loopback.new_request();
    h.loopback.fail_submission_at(2000);

    let err = h.engine.begin_transfer(req, src, 1000, 3).unwrap_err();
    assert!(matches!(err, EngineError::PullSubmit { offset: 2000, .. }));

    // The two pulls already issued still target the buffer.
    assert_eq!(pending_offsets(&h.loopback), vec![0, 1000]);
    assert_eq!(h.loopback.live_buffers(), 1);
    assert_eq!(h.loopback.source_refs(src), Some(1));

    h.loopback.drain();
    let stats = h.loopback.stats();
    assert_eq!(stats.buffers_destroyed, 1);
    assert_eq!(stats.source_releases, 1);
    assert_eq!(stats.requests_released, 1);
    assert_eq!(stats.responses_sent, 0);
    assert_eq!(h.loopback.live_buffers(), 0);
    assert!(h.sink.recorded().is_empty());
    assert_eq!(h.engine.active_sessions(), 0);
}

#[test]
fn refill_submission_failure_aborts() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(3000));
    let req = h.loopback.new_request();
    h.loopback.fail_submission_at(2000);

    let id = h.engine.begin_transfer(req, src, 1000, 2).unwrap();
    complete_at(&h.loopback, 0);

    match h.engine.status(id) {
        Some(SessionStatus::Aborted(AbortReason::Submit { offset, .. })) => assert_eq!(offset, 2000),
        other => panic!("unexpected status {:?}", other),
    }
    // Still one pull outstanding; resources wait for it.
    assert_eq!(h.engine.snapshot(id).unwrap().in_flight, 1);
    assert!(h.engine.snapshot(id).unwrap().resources_held);
    assert_eq!(h.loopback.stats().buffers_destroyed, 0);

    complete_at(&h.loopback, 1000);
    let stats = h.loopback.stats();
    assert_eq!(stats.buffers_destroyed, 1);
    assert_eq!(stats.source_releases, 1);
    assert_eq!(stats.requests_released, 1);
    assert_eq!(stats.responses_sent, 0);
    // The drained chunk never reached the sink.
    assert_eq!(h.sink.total_bytes(), 1000);
}

#[test]
fn failed_completion_aborts_without_refill() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(5000));
    let req = h.loopback.new_request();
    h.loopback.fail_completion_at(1000);

    let id = h.engine.begin_transfer(req, src, 1000, 2).unwrap();
    complete_at(&h.loopback, 1000);
    assert!(matches!(
        h.engine.status(id),
        Some(SessionStatus::Aborted(AbortReason::Pull { offset: 1000, .. }))
    ));
    assert_eq!(pending_offsets(&h.loopback), vec![0]);

    h.loopback.drain();
    assert_eq!(h.loopback.stats().pulls_submitted, 2);
    assert_eq!(h.loopback.stats().buffers_destroyed, 1);
    assert_eq!(h.loopback.stats().responses_sent, 0);
}

#[test]
fn sink_failure_aborts() {
    let h = harness(EngineConfig::default());
    let engine = BulkEngine::new(h.loopback.clone(), EngineConfig::default());
    let mut payload = pattern_payload(3000);
    payload[1500] ^= 0xff;
    let src = h.loopback.expose(payload);
    let req = h.loopback.new_request();

    let id = engine
        .begin_transfer_with_sink(req, src, 1000, 3, Arc::new(PatternVerifier))
        .unwrap();
    h.loopback.drain();

    match engine.take_outcome(id) {
        Some(SessionStatus::Aborted(AbortReason::Sink { offset, source })) => {
            assert_eq!(offset, 1000);
            assert!(matches!(source, SinkError::PatternMismatch { position: 1500, .. }));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let stats = h.loopback.stats();
    assert_eq!(stats.responses_sent, 0);
    assert_eq!(stats.buffers_destroyed, 1);
    assert_eq!(stats.source_releases, 1);
}

#[test]
fn acquisition_failures_are_synchronous() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(100));

    h.loopback.fail_source_acquire();
    let req = h.loopback.new_request();
    assert!(matches!(
        h.engine.begin_transfer(req, src, 10, 2),
        Err(EngineError::SourceAcquire(_))
    ));
    assert!(!h.loopback.is_request_live(req));

    h.loopback.clear_faults();
    h.loopback.fail_buffer_allocation();
    let req = h.loopback.new_request();
    assert_eq!(
        h.engine.begin_transfer(req, src, 10, 2),
        Err(EngineError::BufferAllocation(SubstrateError::Allocation(100)))
    );
    // The reference taken before allocation failed was given back.
    assert_eq!(h.loopback.source_refs(src), Some(0));
    assert_eq!(h.loopback.stats().pulls_submitted, 0);

    let req = h.loopback.new_request();
    assert!(matches!(
        h.engine.begin_transfer(req, haven_bulk::SourceHandle(9999), 10, 2),
        Err(EngineError::RemoteSize(SubstrateError::UnknownSource(9999)))
    ));
}

#[test]
fn out_of_order_completion_finalizes_once() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(3000));
    let req = h.loopback.new_request();

    let id = h.engine.begin_transfer(req, src, 1000, 2).unwrap();
    complete_at(&h.loopback, 1000);
    assert_eq!(pending_offsets(&h.loopback), vec![0, 2000]);

    // Numerically last chunk lands before the first one.
    complete_at(&h.loopback, 2000);
    assert_eq!(h.loopback.stats().responses_sent, 0);
    assert_eq!(h.engine.snapshot(id).unwrap().bytes_received, 2000);

    complete_at(&h.loopback, 0);
    assert_eq!(h.loopback.stats().responses_sent, 1);
    assert_eq!(h.loopback.responses().len(), 1);
    assert_partition(&h.sink.recorded(), 3000);
    assert_eq!(
        h.sink.recorded().iter().map(|c| c.offset).collect::<Vec<_>>(),
        vec![1000, 2000, 0]
    );
}

#[test]
fn sessions_fail_independently() {
    let h = harness(EngineConfig::default());
    let good = h.loopback.expose(pattern_payload(4000));
    let bad = h.loopback.expose(pattern_payload(4000));
    let good_req = h.loopback.new_request();
    let bad_req = h.loopback.new_request();

    let good_id = h.engine.begin_transfer(good_req, good, 1000, 2).unwrap();
    let bad_id = h.engine.begin_transfer(bad_req, bad, 1000, 2).unwrap();
    assert_eq!(h.engine.active_sessions(), 2);

    // Both sources expose the same offsets; fail the bad session's second pull.
    let (bad_pull, _) = h
        .loopback
        .pending_pulls()
        .into_iter()
        .find(|(_, p)| p.source == bad && p.source_offset == 1000)
        .unwrap();
    h.loopback.fail_completion_at(1000);
    assert!(h.loopback.trigger_pull(bad_pull));
    h.loopback.clear_faults();
    h.loopback.drain();

    assert!(matches!(h.engine.status(bad_id), Some(SessionStatus::Aborted(_))));
    assert!(matches!(h.engine.status(good_id), Some(SessionStatus::Completed(_))));
    let (resp_req, resp) = h.loopback.responses().try_recv().unwrap();
    assert_eq!(resp_req, good_req);
    assert_eq!(resp.total_bytes, 4000);
    assert_eq!(h.loopback.live_buffers(), 0);
    assert_eq!(h.loopback.source_refs(good), Some(0));
    assert_eq!(h.loopback.source_refs(bad), Some(0));
}

#[test]
fn progress_thread_end_to_end_with_verifiers() {
    common::init_tracing();
    let loopback = Arc::new(LoopbackSubstrate::new());
    let progress = loopback.spawn_progress_thread();
    let engine = BulkEngine::new(loopback.clone(), EngineConfig::default())
        .with_logger(Arc::new(TracingLogger));

    let size = 1_000_003usize;
    let chunk = 64 * 1024u64;
    let payload = pattern_payload(size);
    let out_dir = std::env::temp_dir().join(format!("haven_bulk_e2e_{}", std::process::id()));
    let out_path = out_dir.join("staged.bin");

    let sinks: Vec<Arc<dyn haven_bulk::ChunkSink>> = vec![
        Arc::new(PatternVerifier),
        Arc::new(DigestVerifier::for_payload(&payload, chunk)),
        Arc::new(FileSink::create(&out_path, size as u64).unwrap()),
    ];
    let responses = loopback.responses();
    let mut ids = Vec::new();
    for sink in sinks {
        let src = loopback.expose(payload.clone());
        let req = loopback.new_request();
        ids.push(engine.begin_transfer_with_sink(req, src, chunk, 4, sink).unwrap());
    }

    for _ in 0..ids.len() {
        let (_, resp) = responses.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(resp.total_bytes, size as u64);
        assert_eq!(resp.sha256, sha256_hex(&payload));
    }
    progress.stop();

    for id in ids {
        assert!(matches!(engine.take_outcome(id), Some(SessionStatus::Completed(_))));
    }
    assert_eq!(std::fs::read(&out_path).unwrap(), payload);
    assert_eq!(loopback.live_buffers(), 0);
    let _ = std::fs::remove_dir_all(&out_dir);
}

#[test]
fn racing_completions_finalize_once() {
    const ROUNDS: usize = 200;
    const THREADS: usize = 4;

    for round in 0..ROUNDS {
        let h = harness(EngineConfig::default().with_max_window_depth(8));
        let payload = pattern_payload(50 * 64);
        let src = h.loopback.expose(payload.clone());
        let req = h.loopback.new_request();
        let id = h.engine.begin_transfer(req, src, 64, 8).unwrap();

        let barrier = Barrier::new(THREADS);
        std::thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    while !h.engine.status(id).is_some_and(|st| st.is_terminal()) {
                        if h.loopback.trigger(1) == 0 {
                            std::thread::yield_now();
                        }
                    }
                });
            }
        });

        let stats = h.loopback.stats();
        assert_eq!(stats.responses_sent, 1, "round {}", round);
        assert_eq!(stats.buffers_destroyed, 1, "round {}", round);
        assert_eq!(stats.source_releases, 1, "round {}", round);
        assert_eq!(stats.requests_released, 1, "round {}", round);
        assert_eq!(stats.pulls_completed, 50, "round {}", round);
        assert_partition(&h.sink.recorded(), payload.len() as u64);
        match h.engine.take_outcome(id) {
            Some(SessionStatus::Completed(resp)) => {
                assert_eq!(resp.sha256, sha256_hex(&payload));
            }
            other => panic!("round {}: unexpected outcome {:?}", round, other),
        }
    }
}

#[test]
fn failed_response_aborts_and_releases() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(2500));
    // Never registered, so the response has nowhere to go.
    let req = RequestHandle(424_242);

    let id = h.engine.begin_transfer(req, src, 1000, 2).unwrap();
    h.loopback.drain();

    assert_eq!(
        h.engine.take_outcome(id),
        Some(SessionStatus::Aborted(AbortReason::Respond(
            SubstrateError::UnknownRequest(424_242)
        )))
    );
    assert_eq!(h.sink.total_bytes(), 2500);
    let stats = h.loopback.stats();
    assert_eq!(stats.responses_sent, 0);
    assert_eq!(stats.buffers_destroyed, 1);
    assert_eq!(stats.source_releases, 1);
    assert_eq!(h.loopback.live_buffers(), 0);
    assert_eq!(h.loopback.source_refs(src), Some(0));
    assert!(h.loopback.responses().is_empty());
}

#[test]
fn shutdown_refuses_new_and_refill_pulls() {
    let h = harness(EngineConfig::default());
    let src = h.loopback.expose(pattern_payload(3000));
    let req = h.loopback.new_request();

    let id = h.engine.begin_transfer(req, src, 1000, 2).unwrap();
    h.loopback.shutdown();

    // Queued pulls still complete; the refill is refused.
    complete_at(&h.loopback, 0);
    assert_eq!(
        h.engine.status(id),
        Some(SessionStatus::Aborted(AbortReason::Submit {
            offset: 2000,
            source: SubstrateError::Shutdown,
        }))
    );
    h.loopback.drain();
    let stats = h.loopback.stats();
    assert_eq!(stats.buffers_destroyed, 1);
    assert_eq!(stats.source_releases, 1);
    assert_eq!(stats.requests_released, 1);
    assert_eq!(stats.responses_sent, 0);

    let req = h.loopback.new_request();
    assert_eq!(
        h.engine.begin_transfer(req, src, 1000, 2),
        Err(EngineError::PullSubmit {
            offset: 0,
            source: SubstrateError::Shutdown,
        })
    );
    assert_eq!(h.loopback.live_buffers(), 0);
    assert!(!h.loopback.is_request_live(req));
}
