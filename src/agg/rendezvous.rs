//! Statistics-header rendezvous.
//!
//! Non-main ranks post one non-blocking send of their local header to
//! the main rank; the main rank posts one receive per peer and folds
//! completions in arrival order (header aggregation is a commutative
//! sum, so arrival order is irrelevant). The aggregated header is then
//! broadcast to every rank as a fixed-size byte image.
//!
//! Headers are tagged with the iteration's gradient count so header
//! traffic cannot be confused with other tagged messages on the same
//! fabric.

use tracing::warn;

use crate::error::Result;
use crate::fabric::{CommFabric, RecvHandle, SendHandle, wait_any};
use crate::header::StatsHeader;
use crate::types::Rank;

/// In-flight header exchange for one iteration.
pub(crate) struct HeaderExchange {
    /// Main rank: one pending receive per peer, indexed like the
    /// receive-header slots. Empty elsewhere.
    recvs: Vec<Option<RecvHandle>>,
    /// Non-main ranks: the pending send of the local header.
    send: Option<SendHandle>,
}

/// Index of a peer slot's source rank: peers number `0..world-1`,
/// skipping the main rank itself.
fn peer_rank(slot: usize, main: Rank) -> Rank {
    if slot as Rank >= main {
        slot as Rank + 1
    } else {
        slot as Rank
    }
}

/// Post the exchange before the gradient reduction starts, so header
/// traffic overlaps with it.
pub(crate) fn begin(
    fabric: &dyn CommFabric,
    header: &StatsHeader,
    tag: u64,
) -> Result<HeaderExchange> {
    if fabric.is_main() {
        let peers = fabric.world_size() as usize - 1;
        let main = fabric.main_rank();
        let mut recvs = Vec::with_capacity(peers);
        for slot in 0..peers {
            recvs.push(Some(fabric.irecv(peer_rank(slot, main), tag)?));
        }
        Ok(HeaderExchange {
            recvs,
            send: None,
        })
    } else {
        let send = fabric.isend(fabric.main_rank(), tag, header.encode())?;
        Ok(HeaderExchange {
            recvs: Vec::new(),
            send: Some(send),
        })
    }
}

/// Fold arrived peer headers into `header` (main rank), then broadcast
/// the aggregate so every rank observes identical statistics.
pub(crate) fn collect(
    fabric: &dyn CommFabric,
    exchange: &mut HeaderExchange,
    header: &mut StatsHeader,
    recv_headers: &mut [StatsHeader],
) -> Result<()> {
    if fabric.is_main() {
        let peers = fabric.world_size() as usize - 1;
        let mut received = 0;
        while received < peers {
            match wait_any(&mut exchange.recvs)? {
                Some((slot, bytes)) => {
                    recv_headers[slot].decode_from(&bytes)?;
                    header.aggregate(&mut recv_headers[slot], true)?;
                    received += 1;
                }
                None => {
                    // All slots drained early; should not happen while
                    // peers are still owed.
                    warn!(received, peers, "header wait-any ran out of pending receives");
                    break;
                }
            }
        }
    }

    let main = fabric.main_rank();
    if fabric.is_main() {
        let mut image = header.encode();
        fabric.bcast(&mut image, main)?;
    } else {
        let mut image = vec![0u8; StatsHeader::byte_len(header.num_eval_nodes())];
        fabric.bcast(&mut image, main)?;
        header.decode_from(&image)?;
    }
    Ok(())
}

/// Wait out the local header send (non-main ranks). Called last in the
/// iteration, after the gradients have been restored.
pub(crate) fn finish(exchange: HeaderExchange) -> Result<()> {
    match exchange.send {
        Some(send) => send.wait(),
        None => Ok(()),
    }
}
