//! Completion queues and their pollable channels.
//!
//! A software queue keeps completions in a bounded `VecDeque` behind an
//! eventfd. The channel is readable exactly while completions are pending:
//! it is signalled when an entry lands in an empty queue and reset when a
//! poll empties the queue, both under the queue lock.
//!
//! A verbs queue wraps a hardware CQ; its channel is the CQ's completion
//! channel, re-armed on every poll.
//!
//! Either kind latches a fault when completions could not be delivered
//! (software overrun, failed hardware poll). [`CompletionQueue::take_fault`]
//! reports it once so the owner can fail the connection.

#[cfg(feature = "verbs")]
use super::verbs::VerbsCq;
use super::{DeviceError, WorkCompletion};
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::warn;

enum Backend {
    Channel {
        entries: Mutex<VecDeque<WorkCompletion>>,
        channel: EventFd,
    },
    #[cfg(feature = "verbs")]
    Verbs(VerbsCq),
}

/// Bounded queue of work completions.
pub struct CompletionQueue {
    depth: usize,
    backend: Backend,
    overruns: AtomicU64,
    fault: AtomicBool,
}

impl CompletionQueue {
    /// Create a software queue holding up to `depth` completions.
    pub fn new(depth: usize) -> Result<Self, DeviceError> {
        let channel = EventFd::from_flags(EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)?;
        Ok(Self::with_backend(
            depth,
            Backend::Channel {
                entries: Mutex::new(VecDeque::with_capacity(depth)),
                channel,
            },
        ))
    }

    #[cfg(feature = "verbs")]
    pub(crate) fn from_verbs(depth: usize, cq: VerbsCq) -> Self {
        Self::with_backend(depth, Backend::Verbs(cq))
    }

    fn with_backend(depth: usize, backend: Backend) -> Self {
        Self {
            depth,
            backend,
            overruns: AtomicU64::new(0),
            fault: AtomicBool::new(false),
        }
    }

    #[cfg(feature = "verbs")]
    pub(crate) fn verbs(&self) -> Option<&VerbsCq> {
        match &self.backend {
            Backend::Verbs(cq) => Some(cq),
            Backend::Channel { .. } => None,
        }
    }

    /// Queue capacity.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Append a completion to a software queue.
    ///
    /// Returns `false` if the queue is full; the completion is dropped and
    /// the queue latches a fault.
    pub fn push(&self, wc: WorkCompletion) -> bool {
        let Backend::Channel { entries, channel } = &self.backend else {
            warn!(qp = wc.qp_num, "Completion pushed into a hardware queue");
            return false;
        };
        let mut entries = entries.lock();
        if entries.len() >= self.depth {
            self.overruns.fetch_add(1, Ordering::Relaxed);
            self.fault.store(true, Ordering::Release);
            warn!(qp = wc.qp_num, wr_id = wc.wr_id, "Completion queue overrun");
            return false;
        }
        if entries.is_empty() {
            if let Err(e) = channel.write(1) {
                warn!(error = %e, "Completion channel signal failed");
            }
        }
        entries.push_back(wc);
        true
    }

    /// Remove up to `max` completions in finish order.
    pub fn poll(&self, max: usize) -> Vec<WorkCompletion> {
        match &self.backend {
            Backend::Channel { entries, channel } => {
                let mut entries = entries.lock();
                let take = max.min(entries.len());
                let batch: Vec<_> = entries.drain(..take).collect();
                if entries.is_empty() && !batch.is_empty() {
                    reset_channel(channel);
                }
                batch
            }
            #[cfg(feature = "verbs")]
            Backend::Verbs(cq) => match cq.poll(max) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "Hardware completion poll failed");
                    self.fault.store(true, Ordering::Release);
                    Vec::new()
                }
            },
        }
    }

    /// Remove every pending completion.
    pub fn drain(&self) -> Vec<WorkCompletion> {
        self.poll(usize::MAX)
    }

    /// Completions buffered in software. Always 0 for a hardware queue.
    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Channel { entries, .. } => entries.lock().len(),
            #[cfg(feature = "verbs")]
            Backend::Verbs(_) => 0,
        }
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completions dropped because the queue was full.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Whether completions were lost since the last call. Clears the latch.
    pub fn take_fault(&self) -> bool {
        self.fault.swap(false, Ordering::AcqRel)
    }
}

fn reset_channel(channel: &EventFd) {
    match channel.read() {
        Ok(_) | Err(Errno::EAGAIN) => {}
        Err(e) => warn!(error = %e, "Completion channel reset failed"),
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.backend {
            Backend::Channel { .. } => "software",
            #[cfg(feature = "verbs")]
            Backend::Verbs(_) => "verbs",
        };
        f.debug_struct("CompletionQueue")
            .field("kind", &kind)
            .field("depth", &self.depth)
            .field("pending", &self.len())
            .field("overruns", &self.overruns())
            .finish()
    }
}

impl AsFd for CompletionQueue {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.backend {
            Backend::Channel { channel, .. } => channel.as_fd(),
            #[cfg(feature = "verbs")]
            Backend::Verbs(cq) => cq.as_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{WcOpcode, WcStatus};
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

    fn wc(wr_id: u64) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            opcode: WcOpcode::Write,
            status: WcStatus::Success,
            byte_len: 8,
            imm_data: None,
            qp_num: 1,
        }
    }

    fn readable(cq: &CompletionQueue) -> bool {
        let mut fds = [PollFd::new(cq.as_fd(), PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO).unwrap() == 1
    }

    #[test]
    fn channel_tracks_pending_entries() {
        let cq = CompletionQueue::new(8).unwrap();
        assert!(!readable(&cq));

        cq.push(wc(1));
        cq.push(wc(2));
        assert!(readable(&cq));

        let first = cq.poll(1);
        assert_eq!(first[0].wr_id, 1);
        assert!(readable(&cq), "one entry still pending");

        let rest = cq.drain();
        assert_eq!(rest.len(), 1);
        assert!(!readable(&cq));
        assert!(cq.is_empty());
    }

    #[test]
    fn full_queue_drops_counts_and_latches_fault() {
        let cq = CompletionQueue::new(2).unwrap();
        assert!(cq.push(wc(1)));
        assert!(cq.push(wc(2)));
        assert!(!cq.take_fault());

        assert!(!cq.push(wc(3)));
        assert_eq!(cq.overruns(), 1);
        assert_eq!(cq.len(), 2);
        assert!(readable(&cq), "an overrun queue still wakes its owner");

        assert!(cq.take_fault());
        assert!(!cq.take_fault(), "the fault is reported once");
    }

    #[test]
    fn finish_order_preserved() {
        let cq = CompletionQueue::new(16).unwrap();
        for id in 0..5 {
            cq.push(wc(id));
        }
        let ids: Vec<_> = cq.drain().iter().map(|c| c.wr_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }
}
