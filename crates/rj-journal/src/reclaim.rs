//! Completion tracking and free-space reclamation.
//!
//! Every committed transaction occupies `[start, end)` in the circular log
//! and gets a [`CommitSeq`]. While its home writes are outstanding it sits
//! in a fixed-capacity in-flight ring. Completions arrive as
//! [`ReclaimMsg`]s on a channel (the cache's completion callbacks only send,
//! they never block) and are applied by the reclaimer thread. A finished
//! commit leaves the ring and is merged into a sorted list of completed runs;
//! runs with consecutive sequence numbers coalesce, so `start` can jump over
//! any number of finished commits at once, but never over an unfinished one.

use crate::journal::Shared;
use rj_error::Result;
use rj_types::CommitSeq;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Message from a home-write completion to the reclaimer thread.
#[derive(Debug)]
pub(crate) enum ReclaimMsg {
    /// `bytes` of commit `seq` reached their home location.
    Written { seq: CommitSeq, bytes: u64 },
    /// A home write of commit `seq` failed with `errno`.
    Failed { seq: CommitSeq, errno: i32 },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InFlight {
    seq: CommitSeq,
    start: u64,
    end: u64,
    total: u64,
    done: u64,
    killed: u64,
}

impl InFlight {
    fn is_complete(&self) -> bool {
        self.done + self.killed >= self.total
    }
}

/// Contiguous log range covered by commits `first_seq..=last_seq`, all of
/// whose home writes have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompletedRun {
    pub first_seq: CommitSeq,
    pub last_seq: CommitSeq,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug)]
pub(crate) struct ReclaimState {
    ring_capacity: usize,
    in_flight: VecDeque<InFlight>,
    completed: Vec<CompletedRun>,
    next_seq: CommitSeq,
    next_reclaim: CommitSeq,
}

impl ReclaimState {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring_capacity,
            in_flight: VecDeque::with_capacity(ring_capacity),
            completed: Vec::new(),
            next_seq: CommitSeq(0),
            next_reclaim: CommitSeq(0),
        }
    }

    /// Claim a ring slot for a commit spanning `[start, end)`. `None` when
    /// the ring is full.
    pub fn try_reserve(&mut self, start: u64, end: u64, total: u64, killed: u64) -> Option<CommitSeq> {
        if self.in_flight.len() >= self.ring_capacity {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq = seq.next();
        self.in_flight.push_back(InFlight {
            seq,
            start,
            end,
            total,
            done: 0,
            killed,
        });
        Some(seq)
    }

    /// Undo the most recent reservation of a commit that never reached the log.
    pub fn cancel(&mut self, seq: CommitSeq) {
        if self.in_flight.back().is_some_and(|entry| entry.seq == seq) {
            self.in_flight.pop_back();
            self.next_seq = seq;
        }
    }

    /// Count `bytes` of completed home writes against `seq`. Returns `true`
    /// when the commit became complete and moved to the completed runs.
    pub fn record(&mut self, seq: CommitSeq, bytes: u64) -> bool {
        let Some(idx) = self.in_flight.iter().position(|entry| entry.seq == seq) else {
            return false;
        };
        let entry = &mut self.in_flight[idx];
        entry.done += bytes;
        if !entry.is_complete() {
            return false;
        }
        let done = *entry;
        self.in_flight.remove(idx);
        self.insert_run(CompletedRun {
            first_seq: done.seq,
            last_seq: done.seq,
            start: done.start,
            end: done.end,
        });
        true
    }

    fn insert_run(&mut self, run: CompletedRun) {
        let idx = self
            .completed
            .partition_point(|existing| existing.first_seq < run.first_seq);
        self.completed.insert(idx, run);

        if idx + 1 < self.completed.len() {
            let next = self.completed[idx + 1];
            if self.completed[idx].last_seq.next() == next.first_seq {
                self.completed[idx].last_seq = next.last_seq;
                self.completed[idx].end = next.end;
                self.completed.remove(idx + 1);
            }
        }
        if idx > 0 {
            let cur = self.completed[idx];
            let prev = &mut self.completed[idx - 1];
            if prev.last_seq.next() == cur.first_seq {
                prev.last_seq = cur.last_seq;
                prev.end = cur.end;
                self.completed.remove(idx);
            }
        }
    }

    /// Pop the completed run that starts at the oldest unreclaimed commit and
    /// return the offset `start` may advance to.
    pub fn take_reclaimable(&mut self, start: u64) -> Option<u64> {
        let first = self.completed.first()?;
        if first.first_seq != self.next_reclaim {
            return None;
        }
        debug_assert_eq!(first.start, start, "completed run must begin at the log start");
        let run = self.completed.remove(0);
        self.next_reclaim = run.last_seq.next();
        Some(run.end)
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[cfg(test)]
    fn runs(&self) -> &[CompletedRun] {
        &self.completed
    }
}

/// Handle to the reclaimer thread.
#[derive(Debug)]
pub(crate) struct Reclaimer {
    tx: Sender<ReclaimMsg>,
    handle: Option<JoinHandle<()>>,
}

impl Reclaimer {
    pub fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("rj-reclaim".to_owned())
            .spawn(move || run(&shared, &rx))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Sender<ReclaimMsg> {
        self.tx.clone()
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(ReclaimMsg::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, rx: &Receiver<ReclaimMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            ReclaimMsg::Written { seq, bytes } => {
                let complete = shared.reclaim.lock().record(seq, bytes);
                trace!(target: "rj::reclaim", seq = seq.0, bytes, complete, "home_write_done");
                if complete
                    && let Err(err) = shared.reclaim_space()
                {
                    debug!(target: "rj::reclaim", seq = seq.0, error = %err, "reclaim_failed");
                }
            }
            ReclaimMsg::Failed { seq, errno } => {
                shared.mark_invalid(&format!("home write of commit {seq} failed (errno {errno})"));
            }
            ReclaimMsg::Shutdown => break,
        }
        shared.reclaimed.notify_all();
    }
    debug!(target: "rj::reclaim", "reclaimer_stopped");
}
