//! # MVCC Controller
//!
//! Timestamp-ordered admission of readers and writers, realized as a single
//! owner thread. The controller exclusively owns the pieces of shared state
//! that must move atomically when a snapshot is published: the access queue
//! of live timestamps, the current head, and the freelist. Every other task
//! talks to it through a request channel carrying a reply sender; nothing
//! mutates this state from outside the thread.
//!
//! ## Requests
//!
//! - `Access`: admit a reader or writer. The timestamp counter increments
//!   only for writers; a reader shares the latest writer's timestamp and is
//!   handed the head root of the instant it was admitted, which pins its
//!   snapshot regardless of later flushes.
//! - `Release`: retire a timestamp and report the new oldest live one (zero
//!   when the queue empties).
//! - `SetSnapshot`: install a just-flushed snapshot, then decide
//!   reclamation. Installing first is what makes the stale-block gate
//!   sound: every reader admitted from this instant on holds the new root,
//!   so a stale block published under timestamp `T` is reclaimable exactly
//!   when the oldest live timestamp is past `T` (or nothing is live at
//!   all). Reclaimed offsets join the live freelist, are evicted from both
//!   cache sides, and the ping-pong caches flip; still-protected offsets
//!   are handed back to the writer to retry at the next drain.
//! - `PopBlock` / `AddBlocks` / `FreeLen`: freelist traffic from the writer.
//! - `CloneShadow`: hand the flush path private copies of the head and
//!   freelist to persist, keeping the live ones untouched until
//!   `SetSnapshot`.
//!
//! ## Queue Shape
//!
//! The access queue is a nondecreasing vector of timestamps, possibly with
//! duplicates (concurrent readers share one). Release zeroes the first
//! match and slides the window forward over retired entries, so the head of
//! the queue is always the oldest live timestamp. Timestamps start at one;
//! zero is the empty-queue sentinel.

pub mod writer;

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{eyre, Result};
use tracing::{debug, error};

use crate::mvcc::writer::Reclaim;
use crate::storage::{FreeList, Head, NodeCache};
use crate::store::Counters;

pub(crate) enum Request {
    Access {
        write: bool,
        reply: Sender<(u64, u64)>,
    },
    Release {
        ts: u64,
        reply: Sender<u64>,
    },
    SetSnapshot {
        pending: Vec<Reclaim>,
        root: u64,
        timestamp: u64,
        reply: Sender<Vec<Reclaim>>,
    },
    PopBlock {
        reply: Sender<Option<u64>>,
    },
    AddBlocks {
        offsets: Vec<u64>,
        reply: Sender<usize>,
    },
    FreeLen {
        reply: Sender<usize>,
    },
    CloneShadow {
        reply: Sender<(Head, FreeList)>,
    },
    Shutdown {
        reply: Sender<bool>,
    },
}

/// Handle to the controller thread. Dropping it shuts the thread down.
pub(crate) struct MvccHandle {
    req: Option<Sender<Request>>,
    thread: Option<JoinHandle<()>>,
}

impl MvccHandle {
    pub fn spawn(
        head: Head,
        freelist: FreeList,
        cache: Arc<NodeCache>,
        counters: Arc<Counters>,
    ) -> Self {
        let (tx, rx) = channel();
        let controller = Controller {
            access_q: Vec::new(),
            ts: head.timestamp.max(1),
            head,
            freelist,
            cache,
            counters,
        };
        let thread = std::thread::Builder::new()
            .name("burrow-mvcc".into())
            .spawn(move || controller.run(rx))
            .ok();
        Self {
            req: Some(tx),
            thread,
        }
    }

    fn call<T>(&self, req: Request, rx: Receiver<T>) -> Result<T> {
        let sender = self
            .req
            .as_ref()
            .ok_or_else(|| eyre!("mvcc controller already shut down"))?;
        sender
            .send(req)
            .map_err(|_| eyre!("mvcc controller is gone"))?;
        rx.recv().map_err(|_| eyre!("mvcc controller dropped a reply"))
    }

    /// Admits an operation; returns its timestamp and the snapshot root.
    pub fn access(&self, write: bool) -> Result<(u64, u64)> {
        let (reply, rx) = channel();
        self.call(Request::Access { write, reply }, rx)
    }

    /// Retires a timestamp; returns the new oldest live timestamp, zero when
    /// none remain.
    pub fn release(&self, ts: u64) -> Result<u64> {
        let (reply, rx) = channel();
        self.call(Request::Release { ts, reply }, rx)
    }

    /// Installs a flushed snapshot and reclaims what the live readers
    /// permit. Returns the offsets still protected by a reader.
    pub fn set_snapshot(
        &self,
        pending: Vec<Reclaim>,
        root: u64,
        timestamp: u64,
    ) -> Result<Vec<Reclaim>> {
        let (reply, rx) = channel();
        self.call(
            Request::SetSnapshot {
                pending,
                root,
                timestamp,
                reply,
            },
            rx,
        )
    }

    pub fn pop_block(&self) -> Result<u64> {
        let (reply, rx) = channel();
        self.call(Request::PopBlock { reply }, rx)?
            .ok_or_else(|| eyre!("freelist exhausted: index file was not extended in time"))
    }

    /// Pushes freshly appended blocks; returns how many were dropped as
    /// garbage because the freelist image was full.
    pub fn add_blocks(&self, offsets: Vec<u64>) -> Result<usize> {
        let (reply, rx) = channel();
        self.call(Request::AddBlocks { offsets, reply }, rx)
    }

    pub fn free_len(&self) -> Result<usize> {
        let (reply, rx) = channel();
        self.call(Request::FreeLen { reply }, rx)
    }

    /// Private copies of the head and freelist for the flush path.
    pub fn clone_shadow(&self) -> Result<(Head, FreeList)> {
        let (reply, rx) = channel();
        self.call(Request::CloneShadow { reply }, rx)
    }

    /// Stops the controller thread. Logs when live accesses are abandoned.
    pub fn shutdown(&mut self) -> Result<()> {
        if let Some(sender) = self.req.take() {
            let (reply, rx) = channel();
            if sender.send(Request::Shutdown { reply }).is_ok() {
                match rx.recv() {
                    Ok(true) => {}
                    Ok(false) => error!("mvcc controller shut down with live accesses"),
                    Err(_) => {}
                }
            }
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }
}

impl Drop for MvccHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

struct Controller {
    access_q: Vec<u64>,
    ts: u64,
    head: Head,
    freelist: FreeList,
    cache: Arc<NodeCache>,
    counters: Arc<Counters>,
}

impl Controller {
    fn run(mut self, rx: Receiver<Request>) {
        while let Ok(req) = rx.recv() {
            match req {
                Request::Access { write, reply } => {
                    if write {
                        self.ts += 1;
                    }
                    self.access_q.push(self.ts);
                    self.counters.op_counts.incr();
                    let _ = reply.send((self.ts, self.head.root));
                }
                Request::Release { ts, reply } => {
                    let _ = reply.send(self.release(ts));
                }
                Request::SetSnapshot {
                    pending,
                    root,
                    timestamp,
                    reply,
                } => {
                    let _ = reply.send(self.set_snapshot(pending, root, timestamp));
                }
                Request::PopBlock { reply } => {
                    let fpos = self.freelist.pop().ok();
                    if fpos.is_some() {
                        self.counters.pop_counts.incr();
                    }
                    let _ = reply.send(fpos);
                }
                Request::AddBlocks { offsets, reply } => {
                    let dropped = self.freelist.add(&offsets);
                    if dropped > 0 {
                        self.counters.garbage_blocks.add(dropped as u64);
                    }
                    let _ = reply.send(dropped);
                }
                Request::FreeLen { reply } => {
                    let _ = reply.send(self.freelist.len());
                }
                Request::CloneShadow { reply } => {
                    let _ = reply.send((self.head.clone(), self.freelist.clone()));
                }
                Request::Shutdown { reply } => {
                    let _ = reply.send(self.access_q.is_empty());
                    break;
                }
            }
        }
    }

    /// Installs the new head, flips the caches, then reclaims every pending
    /// stale block no live reader can still reference.
    fn set_snapshot(&mut self, pending: Vec<Reclaim>, root: u64, timestamp: u64) -> Vec<Reclaim> {
        self.head.set_root(root, timestamp);
        self.cache.flip();

        let oldest = self.access_q.first().copied().unwrap_or(0);
        let mut reclaimed = Vec::new();
        let mut kept = Vec::new();
        for stale in pending {
            if oldest == 0 || stale.publish_ts < oldest {
                reclaimed.push(stale.fpos);
            } else {
                kept.push(stale);
            }
        }

        self.freelist.add(&reclaimed);
        self.cache.evict(&reclaimed);
        self.counters.reclaim_count.add(reclaimed.len() as u64);
        debug!(
            root,
            timestamp,
            reclaimed = reclaimed.len(),
            kept = kept.len(),
            "snapshot installed"
        );
        kept
    }

    /// Zeroes the first queue entry matching `ts`, slides the window over
    /// retired entries, and returns the new oldest live timestamp.
    fn release(&mut self, ts: u64) -> u64 {
        match self.access_q.iter().position(|&live| live == ts) {
            Some(at) => self.access_q[at] = 0,
            None => {
                error!(ts, "release of a timestamp that is not in the access queue");
                return self.access_q.first().copied().unwrap_or(0);
            }
        }

        let skip = self.access_q.iter().take_while(|&&live| live == 0).count();
        self.access_q.drain(..skip);
        self.access_q.first().copied().unwrap_or(0)
    }
}
