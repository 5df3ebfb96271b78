//! Completion queue wrapper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::verbs::{CqHandle, Qpn, Verbs, WcStatus, WrId};

use super::error::{Error, Result};
use super::tracker::QueueTracker;

/// A successfully polled completion.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// Number of the QP the completed work request was posted on.
    pub qp_num: Qpn,
    pub wr_id: WrId,
    /// Number of bytes received; zero for send completions.
    pub byte_len: u32,
}

/// Completion queue with an embedded outstanding-request tracker.
///
/// Exactly one completion is consumed per poll, deliberately: the tracker
/// is the authority on how many completions are owed, and the post-N /
/// poll-N pattern of the engines is correct by construction only with a
/// one-to-one poll. Do not batch.
pub struct CompQueue {
    verbs: Arc<dyn Verbs>,
    cq: CqHandle,
    /// Set until the first completion has been classified. A transport
    /// retry error on the very first completion means misconfigured
    /// connection attributes rather than a lost peer.
    first_wc: AtomicBool,
    outstanding: QueueTracker,
}

impl CompQueue {
    pub fn new(verbs: &Arc<dyn Verbs>, capacity: u16) -> Result<Self> {
        let cq = verbs.create_cq(u32::from(capacity))?;
        Ok(CompQueue {
            verbs: verbs.clone(),
            cq,
            first_wc: AtomicBool::new(true),
            outstanding: QueueTracker::new(capacity),
        })
    }

    pub fn handle(&self) -> CqHandle {
        self.cq
    }

    pub fn capacity(&self) -> u16 {
        self.outstanding.capacity()
    }

    /// Count a work request posted against this CQ.
    pub fn add_outstanding(&self) -> Result<()> {
        if !self.outstanding.add() {
            return Err(Error::Invariant("outstanding completion tracker overrun"));
        }
        Ok(())
    }

    /// Current number of completions owed.
    pub fn outstanding(&self) -> u16 {
        self.outstanding.current()
    }

    /// Poll for a single completion.
    ///
    /// Non-blocking polls return `Ok(None)` when the CQ is empty; blocking
    /// polls busy-loop the underlying poll until one completion arrives.
    pub fn poll(&self, blocking: bool) -> Result<Option<Completion>> {
        let wc = loop {
            match self.verbs.poll_cq(self.cq)? {
                Some(wc) => break wc,
                None if blocking => continue,
                None => return Ok(None),
            }
        };

        match wc.status {
            WcStatus::Success => {}
            WcStatus::RetryExceeded => {
                if self.first_wc.load(Ordering::Relaxed) {
                    return Err(Error::FirstCompletionFailed);
                }
                return Err(Error::Disconnected);
            }
            WcStatus::Error(status) => return Err(Error::CompletionFailure(status)),
        }

        self.first_wc.store(false, Ordering::Relaxed);

        if !self.outstanding.sub() {
            return Err(Error::Invariant("outstanding completion tracker underrun"));
        }

        Ok(Some(Completion {
            qp_num: wc.qp_num,
            wr_id: wc.wr_id,
            byte_len: wc.byte_len,
        }))
    }

    /// Blockingly poll until every outstanding completion has been reaped.
    /// Returns the number of completions consumed.
    pub fn flush(&self) -> Result<u32> {
        let mut count = 0;
        while self.outstanding.current() > 0 {
            self.poll(true)?;
            count += 1;
        }
        Ok(count)
    }
}

impl Drop for CompQueue {
    fn drop(&mut self) {
        if let Err(e) = self.verbs.destroy_cq(self.cq) {
            log::error!("destroying CQ {:?} failed: {}", self.cq, e);
        }
    }
}
