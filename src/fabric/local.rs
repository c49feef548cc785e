//! In-process fabric: every rank lives in one process, one thread each.
//!
//! Collectives rendezvous through a shared cluster core keyed by a
//! per-rank call sequence number; because all ranks issue collectives in
//! the same program order, equal sequence numbers identify the same
//! logical collective. Point-to-point messages go through per
//! `(dst, src, tag)` mailboxes.
//!
//! The last rank to arrive at a collective performs the reduction and
//! fans the result out, so no helper threads are involved.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Sender, bounded};

use crate::error::{GradaxError, Result};
use crate::fabric::{CommFabric, GatherHandle, RecvHandle, ReduceHandle, SendHandle};
use crate::reduce::reduce_slice;
use crate::types::{DataType, Rank, ReduceOp};

/// Cluster-wide knobs for [`LocalFabric`].
#[derive(Debug, Clone)]
pub struct FabricOptions {
    /// Rank designated to collect statistics headers.
    pub main_rank: Rank,
    /// Report GPUDirect RDMA support, steering the aggregator onto the
    /// direct-device transport branch.
    pub gpu_gdr: bool,
}

impl Default for FabricOptions {
    fn default() -> Self {
        Self {
            main_rank: 0,
            gpu_gdr: false,
        }
    }
}

/// One rank's endpoint of an in-process cluster.
pub struct LocalFabric {
    rank: Rank,
    world: u32,
    opts: FabricOptions,
    core: Arc<Mutex<ClusterCore>>,
    /// Collective-call sequence; must advance identically on all ranks.
    seq: AtomicU64,
}

impl LocalFabric {
    /// Build endpoints for all ranks of a `world_size` cluster.
    pub fn cluster(world_size: u32) -> Vec<LocalFabric> {
        Self::cluster_with(world_size, FabricOptions::default())
    }

    pub fn cluster_with(world_size: u32, opts: FabricOptions) -> Vec<LocalFabric> {
        assert!(world_size > 0, "cluster needs at least one rank");
        let core = Arc::new(Mutex::new(ClusterCore::default()));
        (0..world_size)
            .map(|rank| LocalFabric {
                rank,
                world: world_size,
                opts: opts.clone(),
                core: Arc::clone(&core),
                seq: AtomicU64::new(0),
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ClusterCore> {
        // A poisoned core means a peer rank panicked mid-collective; the
        // cluster state is unrecoverable either way.
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Enter collective `seq` with this rank's contribution and a reply
    /// slot. The last arriving rank finalizes the round.
    fn deposit(
        &self,
        seq: u64,
        kind: RoundKind,
        payload: Vec<u8>,
        reply: Sender<Result<Vec<u8>>>,
    ) -> Result<()> {
        let mut core = self.lock();
        let round = core
            .rounds
            .entry(seq)
            .or_insert_with(|| Round::new(self.world, kind.clone()));

        if round.kind != kind {
            return Err(GradaxError::FabricFailed {
                operation: "collective",
                rank: self.rank,
                reason: format!(
                    "rank {} joined seq {seq} as {kind:?} but round is {:?}",
                    self.rank, round.kind
                ),
            });
        }

        let slot = self.rank as usize;
        round.contributions[slot] = Some(payload);
        round.replies[slot] = Some(reply);
        round.arrived += 1;

        if round.arrived == self.world {
            let round = core.rounds.remove(&seq).expect("round present");
            finalize(round);
        }
        Ok(())
    }
}

fn finalize(round: Round) {
    let world = round.replies.len();
    let mut contributions: Vec<Vec<u8>> = round
        .contributions
        .into_iter()
        .map(|c| c.expect("all ranks contributed"))
        .collect();

    let result: Vec<u8> = match round.kind {
        RoundKind::Reduce { count, dtype, op } => {
            let mut acc = contributions[0].clone();
            for other in &contributions[1..] {
                reduce_slice(&mut acc, other, count, dtype, op);
            }
            acc
        }
        RoundKind::Gather => {
            let total: usize = contributions.iter().map(Vec::len).sum();
            let mut out = Vec::with_capacity(total);
            for c in &contributions {
                out.extend_from_slice(c);
            }
            out
        }
        RoundKind::Bcast { root } => std::mem::take(&mut contributions[root as usize]),
    };

    for reply in round.replies.into_iter().take(world).flatten() {
        // Receiver side may have been dropped by a dying rank; nothing
        // useful to do about it here.
        let _ = reply.send(Ok(result.clone()));
    }
}

impl CommFabric for LocalFabric {
    fn world_size(&self) -> u32 {
        self.world
    }

    fn rank(&self) -> Rank {
        self.rank
    }

    fn main_rank(&self) -> Rank {
        self.opts.main_rank
    }

    fn use_gpu_gdr(&self) -> bool {
        self.opts.gpu_gdr
    }

    fn all_reduce(
        &self,
        buf: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let expected = count * dtype.size_in_bytes();
        if buf.len() != expected {
            return Err(GradaxError::BufferSizeMismatch {
                expected,
                actual: buf.len(),
            });
        }
        let handle = self.iallreduce(buf.to_vec(), count, dtype, op)?;
        let out = handle.wait()?;
        buf.copy_from_slice(&out);
        Ok(())
    }

    fn all_gather(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let expected = src.len() * self.world as usize;
        if dst.len() != expected {
            return Err(GradaxError::BufferSizeMismatch {
                expected,
                actual: dst.len(),
            });
        }
        let out = self.iallgather(src.to_vec())?.wait()?;
        dst.copy_from_slice(&out);
        Ok(())
    }

    fn bcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        let payload = if self.rank == root {
            buf.to_vec()
        } else {
            Vec::new()
        };
        let (tx, rx) = bounded(1);
        self.deposit(self.next_seq(), RoundKind::Bcast { root }, payload, tx)?;
        let out = rx.recv().map_err(|_| GradaxError::WorkerGone)??;
        if out.len() != buf.len() {
            return Err(GradaxError::BufferSizeMismatch {
                expected: buf.len(),
                actual: out.len(),
            });
        }
        buf.copy_from_slice(&out);
        Ok(())
    }

    fn isend(&self, to: Rank, tag: u64, bytes: Vec<u8>) -> Result<SendHandle> {
        let mut core = self.lock();
        let mailbox = core.mailboxes.entry((to, self.rank, tag)).or_default();
        match mailbox.waiting.take() {
            Some(tx) => {
                let _ = tx.send(Ok(bytes));
            }
            None => mailbox.queued.push_back(bytes),
        }
        Ok(SendHandle::ready())
    }

    fn irecv(&self, from: Rank, tag: u64) -> Result<RecvHandle> {
        let (tx, rx) = bounded(1);
        let mut core = self.lock();
        let mailbox = core.mailboxes.entry((self.rank, from, tag)).or_default();
        if let Some(bytes) = mailbox.queued.pop_front() {
            let _ = tx.send(Ok(bytes));
        } else {
            if mailbox.waiting.is_some() {
                return Err(GradaxError::ReceiveInFlight { from_rank: from, tag });
            }
            mailbox.waiting = Some(tx);
        }
        Ok(RecvHandle::pending(rx))
    }

    fn iallreduce(
        &self,
        buf: Vec<u8>,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<ReduceHandle> {
        let expected = count * dtype.size_in_bytes();
        if buf.len() != expected {
            return Err(GradaxError::BufferSizeMismatch {
                expected,
                actual: buf.len(),
            });
        }
        let (tx, rx) = bounded(1);
        self.deposit(self.next_seq(), RoundKind::Reduce { count, dtype, op }, buf, tx)?;
        Ok(ReduceHandle::pending(rx))
    }

    fn iallgather(&self, src: Vec<u8>) -> Result<GatherHandle> {
        let (tx, rx) = bounded(1);
        self.deposit(self.next_seq(), RoundKind::Gather, src, tx)?;
        Ok(GatherHandle::pending(rx))
    }
}

#[derive(Default)]
struct ClusterCore {
    rounds: HashMap<u64, Round>,
    mailboxes: HashMap<(Rank, Rank, u64), Mailbox>,
}

#[derive(Default)]
struct Mailbox {
    queued: VecDeque<Vec<u8>>,
    waiting: Option<Sender<Result<Vec<u8>>>>,
}

struct Round {
    kind: RoundKind,
    arrived: u32,
    contributions: Vec<Option<Vec<u8>>>,
    replies: Vec<Option<Sender<Result<Vec<u8>>>>>,
}

impl Round {
    fn new(world: u32, kind: RoundKind) -> Self {
        Self {
            kind,
            arrived: 0,
            contributions: vec![None; world as usize],
            replies: (0..world).map(|_| None).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RoundKind {
    Reduce {
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    },
    Gather,
    Bcast {
        root: Rank,
    },
}
