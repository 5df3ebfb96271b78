//! Job records and the bounded job queue feeding the job worker.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crate::verbs::{Lid, Qpn};

use crate::ib::{NodeId, MAX_QPS_PER_CONNECTION};

/// Capacity of the job queue.
pub const JOB_QUEUE_SIZE: u32 = 1024;

/// QP id slot value marking "unused" in fixed-size id arrays.
pub const QP_ID_UNUSED: Qpn = 0xFFFF_FFFF;

/// Fixed-size job record; lives in the ring by value.
#[derive(Debug, Clone, Copy)]
pub enum Job {
    /// Ensure a connection to the node exists and push our QP parameters
    /// to it.
    Create { node_id: NodeId },
    /// Same, with the remote QP parameters received over the exchange
    /// channel.
    CreateWithRemote {
        node_id: NodeId,
        ident: u32,
        lid: Lid,
        qp_ids: [Qpn; MAX_QPS_PER_CONNECTION],
    },
    /// Tear the connection down.
    Close {
        node_id: NodeId,
        force: bool,
        shutdown: bool,
    },
    /// A discovery response arrived for the node at this address.
    Discovered { node_id: NodeId, ip: Ipv4Addr },
}

/// Bounded multi-producer single-consumer ring of job records.
///
/// Producers reserve a slot at `back_res` with a CAS, write it, then wait
/// for every preceding reservation to publish before advancing `back`.
/// The single consumer reads at `front` and releases the slot by
/// advancing it. Size must be a power of two so the modulo arithmetic
/// survives cursor wrap-around.
pub struct JobQueue {
    size: u32,
    front: AtomicU32,
    back: AtomicU32,
    back_res: AtomicU32,
    slots: Box<[UnsafeCell<MaybeUninit<Job>>]>,
}

// SAFETY: slot access is serialized by the reservation protocol; a slot is
// written by exactly one producer between its reservation and publication,
// and read by the single consumer only after publication.
unsafe impl Sync for JobQueue {}
unsafe impl Send for JobQueue {}

impl JobQueue {
    pub fn new(size: u32) -> Self {
        assert!(size.is_power_of_two(), "job queue size must be a power of two");
        let slots = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        JobQueue {
            size,
            front: AtomicU32::new(0),
            back: AtomicU32::new(0),
            back_res: AtomicU32::new(0),
            slots,
        }
    }

    /// Append a job. Returns false if the queue is full.
    pub fn push_back(&self, job: Job) -> bool {
        let mut back_res = self.back_res.load(Ordering::Relaxed);

        loop {
            let front = self.front.load(Ordering::Relaxed);

            if back_res.wrapping_add(1) % self.size == front % self.size {
                return false;
            }

            match self.back_res.compare_exchange_weak(
                back_res,
                back_res.wrapping_add(1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // SAFETY: the slot at back_res is reserved for us until
                    // we publish below.
                    unsafe {
                        (*self.slots[(back_res % self.size) as usize].get()).write(job);
                    }

                    // wait for any preceding reservations to publish before
                    // updating back
                    while self
                        .back
                        .compare_exchange(
                            back_res,
                            back_res.wrapping_add(1),
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_err()
                    {
                        thread::yield_now();
                    }

                    return true;
                }
                Err(current) => back_res = current,
            }
        }
    }

    /// Take the oldest job, if any. Single consumer only.
    pub fn pop_front(&self) -> Option<Job> {
        let front = self.front.load(Ordering::Relaxed);
        let back = self.back.load(Ordering::Acquire);

        if front % self.size == back % self.size {
            return None;
        }

        // SAFETY: the slot was published by the Release store on `back`
        // and is not reused until `front` passes it.
        let job = unsafe { (*self.slots[(front % self.size) as usize].get()).assume_init() };

        self.front.fetch_add(1, Ordering::Release);
        Some(job)
    }

    pub fn is_empty(&self) -> bool {
        let front = self.front.load(Ordering::Relaxed);
        let back = self.back.load(Ordering::Relaxed);
        front % self.size == back % self.size
    }
}

/// Producer-side interface to the job worker: the job ring plus the
/// out-of-band discovery flag. Discovery is a flag rather than a queued
/// job so it can never crowd out connection establishment.
pub struct JobChannel {
    queue: JobQueue,
    run_discovery: AtomicBool,
}

impl JobChannel {
    pub fn new() -> Self {
        JobChannel {
            queue: JobQueue::new(JOB_QUEUE_SIZE),
            run_discovery: AtomicBool::new(false),
        }
    }

    /// Enqueue, retrying while the ring is full.
    fn add(&self, job: Job) {
        while !self.queue.push_back(job) {
            log::warn!("job queue full, waiting...");
            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn add_create_job(&self, node_id: NodeId) {
        self.add(Job::Create { node_id });
    }

    pub fn add_create_with_remote_job(
        &self,
        node_id: NodeId,
        ident: u32,
        lid: Lid,
        qp_ids: [Qpn; MAX_QPS_PER_CONNECTION],
    ) {
        self.add(Job::CreateWithRemote {
            node_id,
            ident,
            lid,
            qp_ids,
        });
    }

    pub fn add_close_job(&self, node_id: NodeId, force: bool, shutdown: bool) {
        self.add(Job::Close {
            node_id,
            force,
            shutdown,
        });
    }

    pub fn add_discovered_job(&self, node_id: NodeId, ip: Ipv4Addr) {
        self.add(Job::Discovered { node_id, ip });
    }

    pub fn add_discover_job(&self) {
        self.run_discovery.store(true, Ordering::Relaxed);
    }

    /// Consume the discovery request flag, if set.
    pub fn take_discover_job(&self) -> bool {
        self.run_discovery
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    pub fn pop(&self) -> Option<Job> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn create_job(node_id: NodeId) -> Job {
        Job::Create { node_id }
    }

    fn node_of(job: Job) -> NodeId {
        match job {
            Job::Create { node_id } => node_id,
            Job::CreateWithRemote { node_id, .. } => node_id,
            Job::Close { node_id, .. } => node_id,
            Job::Discovered { node_id, .. } => node_id,
        }
    }

    #[test]
    fn fifo_order() {
        let queue = JobQueue::new(8);
        for i in 0..5 {
            assert!(queue.push_back(create_job(i)));
        }
        for i in 0..5 {
            assert_eq!(node_of(queue.pop_front().unwrap()), i);
        }
        assert!(queue.pop_front().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_rejects() {
        let queue = JobQueue::new(4);
        // one slot stays open to distinguish full from empty
        assert!(queue.push_back(create_job(0)));
        assert!(queue.push_back(create_job(1)));
        assert!(queue.push_back(create_job(2)));
        assert!(!queue.push_back(create_job(3)));

        queue.pop_front().unwrap();
        assert!(queue.push_back(create_job(3)));
    }

    #[test]
    fn wraps_around() {
        let queue = JobQueue::new(4);
        for round in 0..20 {
            assert!(queue.push_back(create_job(round)));
            assert_eq!(node_of(queue.pop_front().unwrap()), round);
        }
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(JobQueue::new(256));
        let mut handles = Vec::new();
        for producer in 0..4u16 {
            let queue = queue.clone();
            handles.push(thread::spawn(move || {
                for i in 0..50u16 {
                    let id = producer * 100 + i;
                    while !queue.push_back(create_job(id)) {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < 200 {
            if let Some(job) = queue.pop_front() {
                seen.push(node_of(job));
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // FIFO per producer
        for producer in 0..4u16 {
            let ids: Vec<_> = seen
                .iter()
                .copied()
                .filter(|id| id / 100 == producer)
                .collect();
            assert_eq!(ids.len(), 50);
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn discovery_flag_is_level_triggered() {
        let channel = JobChannel::new();
        assert!(!channel.take_discover_job());
        channel.add_discover_job();
        channel.add_discover_job();
        assert!(channel.take_discover_job());
        assert!(!channel.take_discover_job());
    }
}
