use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{error, info, warn};

use haven_bulk::{
    BulkEngine, EngineConfig, LoopbackSubstrate, PatternVerifier, RequestHandle, SessionStatus,
    TransferResponse, pattern_payload,
};

const DEFAULT_DEMO_SIZES: &str = "0,1000,2500,33554432,50331653";

/// How long the batch may go without any response before giving up.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the outcome table is re-checked while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn parse_sizes(raw: &str) -> anyhow::Result<Vec<usize>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .with_context(|| format!("invalid transfer size {:?}", s))
        })
        .collect()
}

/// Log responses until no session is active. Aborted sessions never
/// respond, so the table is re-checked every `poll`. Returns how many
/// responses arrived.
fn wait_for_batch(
    engine: &BulkEngine,
    responses: &Receiver<(RequestHandle, TransferResponse)>,
    poll: Duration,
    timeout: Duration,
) -> usize {
    let log = |request: RequestHandle, resp: TransferResponse| {
        info!(
            "request {} done: session={} bytes={} chunks={} sha256={}",
            request, resp.session_id, resp.total_bytes, resp.chunks, resp.sha256
        );
    };
    let mut received = 0;
    let mut last_progress = Instant::now();
    loop {
        match responses.recv_timeout(poll) {
            Ok((request, resp)) => {
                received += 1;
                last_progress = Instant::now();
                log(request, resp);
            }
            Err(RecvTimeoutError::Timeout) => {
                let active = engine.active_sessions();
                if active == 0 {
                    break;
                }
                if last_progress.elapsed() >= timeout {
                    error!("{} sessions still active after {:?}", active, timeout);
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // A response can land between the last poll and the table check.
    for (request, resp) in responses.try_iter() {
        received += 1;
        log(request, resp);
    }
    received
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven_bulk=debug,haven_bulk_server=info".into()),
        )
        .init();

    // Config
    let config = EngineConfig::from_env();
    let sizes = parse_sizes(
        &std::env::var("HAVEN_BULK_DEMO_SIZES").unwrap_or_else(|_| DEFAULT_DEMO_SIZES.into()),
    )?;
    let window: usize = std::env::var("HAVEN_BULK_DEMO_WINDOW")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(config.max_window_depth);
    info!(
        "chunk_size={} max_window={} empty_transfer={:?} window={} transfers={}",
        config.default_chunk_size,
        config.max_window_depth,
        config.empty_transfer,
        window,
        sizes.len()
    );

    // Substrate and its progress loop
    let loopback = Arc::new(LoopbackSubstrate::new());
    let progress = loopback.spawn_progress_thread();
    let responses = loopback.responses();
    let engine = BulkEngine::new(loopback.clone(), config);

    let started = Instant::now();
    let mut sessions = Vec::with_capacity(sizes.len());
    for size in &sizes {
        let source = loopback.expose(pattern_payload(*size));
        let request = loopback.new_request();
        match engine.begin_transfer_with_sink(request, source, 0, window, Arc::new(PatternVerifier)) {
            Ok(id) => sessions.push((id, *size)),
            Err(e) => warn!("transfer of {} bytes rejected: {}", size, e),
        }
    }

    let responded = wait_for_batch(&engine, &responses, POLL_INTERVAL, RESPONSE_TIMEOUT);
    info!("{} responses received", responded);
    loopback.shutdown();
    progress.stop();

    let mut failed = 0;
    for (id, size) in sessions {
        match engine.take_outcome(id) {
            Some(SessionStatus::Completed(resp)) if resp.total_bytes == size as u64 => {}
            Some(SessionStatus::Completed(resp)) => {
                failed += 1;
                error!("session {} delivered {} of {} bytes", id, resp.total_bytes, size);
            }
            Some(SessionStatus::Aborted(reason)) => {
                failed += 1;
                error!("session {} aborted: {}", id, reason);
            }
            Some(SessionStatus::Active) | None => {
                failed += 1;
                error!("session {} never finished", id);
            }
        }
    }

    let stats = loopback.stats();
    info!(
        "batch finished in {:?}: pulls={} responses={} buffers={}/{} live_buffers={}",
        started.elapsed(),
        stats.pulls_completed,
        stats.responses_sent,
        stats.buffers_destroyed,
        stats.buffers_created,
        loopback.live_buffers()
    );

    if failed > 0 {
        bail!("{} transfers failed", failed);
    }
    Ok(())
}
