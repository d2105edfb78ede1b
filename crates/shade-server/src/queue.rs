//! Bounded lock-free rings wiring RPC, parser, and worker.
//!
//! Each ring has exactly one producer and one consumer thread; the bounded
//! capacity is the back-pressure mechanism (a full ring makes the producer
//! spin-yield).

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::apicxt::ApiContext;
use crate::command::CommandQe;

/// Default capacity of every pipeline ring.
pub const RING_CAPACITY: usize = 1024;

pub struct Ring<T> {
    q: ArrayQueue<T>,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self { q: ArrayQueue::new(capacity) })
    }

    /// Try to enqueue; gives the element back when the ring is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.q.push(item)
    }

    /// Enqueue, spinning until a slot frees up.
    pub fn push_blocking(&self, mut item: T) {
        loop {
            match self.q.push(item) {
                Ok(()) => return,
                Err(back) => {
                    item = back;
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.q.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }
}

/// The queue group of one client: five API-context rings plus the two
/// command queue pairs.
pub struct QueueGroup {
    // api context queue pair from the RPC frontend to the parser
    pub apicxt_rpc2parser_wq: Arc<Ring<Box<ApiContext>>>,
    pub apicxt_rpc2parser_cq: Arc<Ring<Box<ApiContext>>>,

    // api context work queue from the parser to the worker
    pub apicxt_parser2worker_wq: Arc<Ring<Box<ApiContext>>>,

    // retired QEs recorded by the worker while an async checkpoint is in flight
    pub apicxt_workerlocal_ckptdag_wq: Arc<Ring<u64>>,

    // api context completion queue from the worker to the RPC frontend
    pub apicxt_rpc2worker_cq: Arc<Ring<Box<ApiContext>>>,

    // command queue pair from the OOB acceptor to the parser
    pub cmd_oob2parser_wq: Arc<Ring<Box<CommandQe>>>,
    pub cmd_oob2parser_cq: Arc<Ring<Box<CommandQe>>>,

    // command queue pair from the parser to the worker
    pub cmd_parser2worker_wq: Arc<Ring<Box<CommandQe>>>,
    pub cmd_parser2worker_cq: Arc<Ring<Box<CommandQe>>>,
}

impl QueueGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            apicxt_rpc2parser_wq: Ring::new(RING_CAPACITY),
            apicxt_rpc2parser_cq: Ring::new(RING_CAPACITY),
            apicxt_parser2worker_wq: Ring::new(RING_CAPACITY),
            apicxt_workerlocal_ckptdag_wq: Ring::new(RING_CAPACITY),
            apicxt_rpc2worker_cq: Ring::new(RING_CAPACITY),
            cmd_oob2parser_wq: Ring::new(64),
            cmd_oob2parser_cq: Ring::new(64),
            cmd_parser2worker_wq: Ring::new(64),
            cmd_parser2worker_cq: Ring::new(64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let ring: Arc<Ring<u32>> = Ring::new(8);
        for i in 0..8 {
            ring.push(i).unwrap();
        }
        assert!(ring.push(99).is_err());
        for i in 0..8 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn push_blocking_waits_for_slot() {
        let ring: Arc<Ring<u32>> = Ring::new(1);
        ring.push(1).unwrap();
        let r2 = ring.clone();
        let t = std::thread::spawn(move || r2.push_blocking(2));
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(ring.pop(), Some(1));
        t.join().unwrap();
        assert_eq!(ring.pop(), Some(2));
    }
}
