/// Per-chunk completion handling.
///
/// Every pull the session submits routes its completion here. The whole
/// step runs under the session lock, so two completions racing to observe
/// the final byte cannot both finalize.

use std::sync::Arc;

use crate::error::{AbortReason, SubstrateError};
use crate::logging::TransferEvent;
use crate::planner::ChunkDescriptor;
use crate::session::{SessionState, TransferSession};
use crate::substrate::PullId;
use crate::window::SlotId;

pub(crate) fn on_pull_complete(
    session: &Arc<TransferSession>,
    slot: SlotId,
    chunk: ChunkDescriptor,
    pull_id: PullId,
    result: Result<(), SubstrateError>,
) {
    let mut inner = session.inner.lock();
    inner.window.complete(slot);

    if inner.state.is_terminal() {
        session.log(TransferEvent::CompletionDiscarded {
            slot,
            offset: chunk.offset,
        });
        session.release_if_drained(&mut inner);
        return;
    }
    debug_assert_eq!(inner.state, SessionState::Streaming);

    if let Err(source) = result {
        tracing::warn!(session = %session.id(), pull = %pull_id, "pull failed: {}", source);
        session.abort(
            &mut inner,
            AbortReason::Pull {
                offset: chunk.offset,
                source,
            },
        );
        return;
    }

    // 1. Materialize/verify the range that just arrived.
    let materialized = match inner.resources.as_ref().and_then(|r| r.buffer()) {
        Some(buffer) => buffer
            .memory
            .with_range(chunk.offset, chunk.length, |bytes| {
                session.sink.materialize(session.id(), chunk, bytes)
            })
            .map_err(|source| AbortReason::Pull {
                offset: chunk.offset,
                source,
            })
            .and_then(|sunk| {
                sunk.map_err(|source| AbortReason::Sink {
                    offset: chunk.offset,
                    source,
                })
            }),
        None => Err(AbortReason::Pull {
            offset: chunk.offset,
            source: SubstrateError::Other("staging buffer already released".into()),
        }),
    };
    if let Err(reason) = materialized {
        session.abort(&mut inner, reason);
        return;
    }

    // 2. Count it.
    inner.bytes_received += chunk.length;
    session.log(TransferEvent::ChunkMaterialized {
        slot,
        offset: chunk.offset,
        length: chunk.length,
        bytes_received: inner.bytes_received,
    });

    // 3. Refill this slot while chunks remain.
    if inner.window.has_unissued() {
        if let Err(failure) = session.issue(&mut inner, slot) {
            session.abort(&mut inner, failure.into());
        }
        return;
    }

    // 4. The running total decides completion, not the slot index.
    let total_size = inner.window.plan().total_size();
    if inner.bytes_received == total_size {
        session.finalize(&mut inner);
    } else {
        // 5. Others still in flight.
        session.log(TransferEvent::SlotIdle { slot });
    }
}
