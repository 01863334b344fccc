use crate::resolve::RemoteAddr;
use lodestone::logging;
use lodestone::shared::FaultKind;
use std::collections::VecDeque;

/// Operation flags, shared between submission and the completions that
/// answer it.
pub mod flags {
    pub const SEND: u64 = 1 << 0;
    pub const RECV: u64 = 1 << 1;
    pub const MSG: u64 = 1 << 2;
    pub const TAGGED: u64 = 1 << 3;
    pub const RMA: u64 = 1 << 4;
    pub const READ: u64 = 1 << 5;
    pub const WRITE: u64 = 1 << 6;
    pub const ATOMIC: u64 = 1 << 7;
    pub const REMOTE_CQ_DATA: u64 = 1 << 8;
    pub const MULTI_RECV: u64 = 1 << 9;
    pub const DELIVERY_COMPLETE: u64 = 1 << 10;
}

/// Successful completion delivered to the user.
#[derive(Debug)]
pub struct Completion {
    pub context: u64,
    pub flags: u64,
    pub len: usize,
    pub data: u64,
    pub tag: u64,
    /// Owned buffers handed back to the user. `None` for zero-length
    /// transfers and for completions that carry no buffer.
    pub buf: Option<Vec<Vec<u8>>>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompErrKind {
    Canceled,
    Fault(FaultKind),
}

/// Error completion. Carries the same identity fields as a success plus the
/// error kind and the provider error code.
#[derive(Debug)]
pub struct CompErr {
    pub context: u64,
    pub flags: u64,
    pub kind: CompErrKind,
    pub prov_code: i32,
    pub buf: Option<Vec<Vec<u8>>>,
}

/// Bounded completion queue bound to the endpoint. Overflow never blocks the
/// progress engine: the completion is dropped, counted and logged.
pub struct CompletionQueue {
    items: VecDeque<Completion>,
    errs: VecDeque<CompErr>,
    capacity: usize,
    overflow: u64,
    log: logging::Logger,
}

impl CompletionQueue {
    pub fn new(capacity: usize, log: logging::Logger) -> CompletionQueue {
        CompletionQueue {
            items: VecDeque::new(),
            errs: VecDeque::new(),
            capacity,
            overflow: 0,
            log,
        }
    }

    pub fn push(&mut self, completion: Completion) {
        if self.items.len() >= self.capacity {
            self.overflow += 1;
            logging::error!(self.log, "completion queue overrun, completion dropped";
                            "context" => "cq_push",
                            "cq_context" => completion.context,
                            "overflow" => self.overflow);
            return;
        }

        self.items.push_back(completion);
    }

    pub fn push_err(&mut self, err: CompErr) {
        if self.errs.len() >= self.capacity {
            self.overflow += 1;
            logging::error!(self.log, "error queue overrun, completion dropped";
                            "context" => "cq_push_err",
                            "cq_context" => err.context,
                            "overflow" => self.overflow);
            return;
        }

        self.errs.push_back(err);
    }

    /// Reads up to `max` completions in delivery order.
    pub fn read(&mut self, max: usize) -> Vec<Completion> {
        let count = max.min(self.items.len());
        self.items.drain(..count).collect()
    }

    pub fn read_err(&mut self, max: usize) -> Vec<CompErr> {
        let count = max.min(self.errs.len());
        self.errs.drain(..count).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn err_len(&self) -> usize {
        self.errs.len()
    }

    #[inline]
    pub fn overflow(&self) -> u64 {
        self.overflow
    }
}

/// Bound counter pair: successes and errors, one per direction.
#[derive(Debug, Default, Copy, Clone)]
pub struct Counter {
    pub success: u64,
    pub errors: u64,
}

impl Counter {
    #[inline]
    pub fn add(&mut self) {
        self.success += 1;
    }

    #[inline]
    pub fn add_err(&mut self) {
        self.errors += 1;
    }
}

/// Events with no owning transfer entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Event {
    /// A control send to the peer failed terminally; the peer was isolated.
    PeerFailed {
        addr: RemoteAddr,
        fault: FaultKind,
        /// Unix timestamp of the isolation.
        at: u64,
    },
}

pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> EventQueue {
        EventQueue {
            events: VecDeque::new(),
        }
    }

    #[inline]
    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn read(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(context: u64) -> Completion {
        Completion {
            context,
            flags: flags::SEND | flags::MSG,
            len: 0,
            data: 0,
            tag: 0,
            buf: None,
        }
    }

    #[test]
    fn test_cq_delivers_in_order() {
        let mut cq = CompletionQueue::new(8, logging::discard());

        cq.push(completion(1));
        cq.push(completion(2));
        cq.push(completion(3));

        let read: Vec<_> = cq.read(2).iter().map(|item| item.context).collect();
        assert_eq!(read, vec![1, 2]);
        assert_eq!(cq.len(), 1);
    }

    #[test]
    fn test_cq_overflow_drops_and_counts() {
        let mut cq = CompletionQueue::new(2, logging::discard());

        cq.push(completion(1));
        cq.push(completion(2));
        cq.push(completion(3));

        assert_eq!(cq.len(), 2);
        assert_eq!(cq.overflow(), 1);
    }

    #[test]
    fn test_error_queue_is_separate() {
        let mut cq = CompletionQueue::new(4, logging::discard());

        cq.push(completion(1));
        cq.push_err(CompErr {
            context: 9,
            flags: flags::RECV,
            kind: CompErrKind::Canceled,
            prov_code: 0,
            buf: None,
        });

        assert_eq!(cq.len(), 1);
        assert_eq!(cq.err_len(), 1);
        assert_eq!(cq.read_err(8)[0].context, 9);
    }
}
