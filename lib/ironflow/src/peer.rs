use crate::entry::{RxId, TxId};
use crate::pool::PktId;
use crate::resolve::{EpName, RemoteAddr};
use crate::transport::TransportKind;
use indexmap::IndexSet;
use lodestone::logging;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Per-remote-endpoint state. Every transfer consults its peer record for
/// credits, the backoff gate and the retry queues.
pub struct Peer {
    pub addr: RemoteAddr,
    pub name: EpName,
    pub node_local: bool,

    // Handshake progress
    pub handshake_queued: bool,
    pub handshake_sent: bool,
    pub handshake_reply: bool,
    pub features: u64,

    /// Set when a control send to this peer failed terminally. A failed peer
    /// accepts no further work; queued entries are completed in error.
    pub failed: bool,

    /// Transmit credits granted by the remote receiver, in packets.
    pub tx_credits: u32,

    nic_outstanding: u32,
    shm_outstanding: u32,

    backoff_until: Option<Instant>,
    backoff_window: Duration,

    /// Every packet of ours the fabric currently holds for this peer. Used to
    /// invalidate in-flight work when the peer is removed.
    pub outstanding_pkts: IndexSet<PktId>,

    // Entries queued for retry against this peer
    pub tx_rnr: VecDeque<TxId>,
    pub tx_ctrl: VecDeque<TxId>,
    pub rx_rnr: VecDeque<RxId>,
    pub rx_ctrl: VecDeque<RxId>,

    pub log: logging::Logger,
}

impl Peer {
    pub fn new(addr: RemoteAddr, name: EpName, node_local: bool, log: logging::Logger) -> Peer {
        Peer {
            addr,
            name,
            node_local,
            handshake_queued: false,
            handshake_sent: false,
            handshake_reply: false,
            features: 0,
            failed: false,
            tx_credits: 0,
            nic_outstanding: 0,
            shm_outstanding: 0,
            backoff_until: None,
            backoff_window: Duration::from_micros(0),
            outstanding_pkts: IndexSet::new(),
            tx_rnr: VecDeque::new(),
            tx_ctrl: VecDeque::new(),
            rx_rnr: VecDeque::new(),
            rx_ctrl: VecDeque::new(),
            log,
        }
    }

    #[inline]
    pub fn transport(&self) -> TransportKind {
        match self.node_local {
            true => TransportKind::Shm,
            false => TransportKind::Nic,
        }
    }

    #[inline]
    pub fn outstanding(&self, kind: TransportKind) -> u32 {
        match kind {
            TransportKind::Nic => self.nic_outstanding,
            TransportKind::Shm => self.shm_outstanding,
        }
    }

    #[inline]
    pub fn bump_outstanding(&mut self, kind: TransportKind) {
        match kind {
            TransportKind::Nic => self.nic_outstanding += 1,
            TransportKind::Shm => self.shm_outstanding += 1,
        }
    }

    #[inline]
    pub fn drop_outstanding(&mut self, kind: TransportKind) {
        match kind {
            TransportKind::Nic => self.nic_outstanding -= 1,
            TransportKind::Shm => self.shm_outstanding -= 1,
        }
    }

    /// Takes `count` credits if the balance allows, all or nothing.
    #[inline]
    pub fn take_credits(&mut self, count: u32) -> bool {
        if self.tx_credits >= count {
            self.tx_credits -= count;
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn refund_credits(&mut self, count: u32) {
        self.tx_credits += count;
    }

    #[inline]
    pub fn in_backoff(&self, now: Instant) -> bool {
        match self.backoff_until {
            Some(deadline) => now < deadline,
            None => false,
        }
    }

    /// Starts or escalates the quiet period after receiver-not-ready. The
    /// window doubles per consecutive event, bounded by `max`.
    pub fn enter_backoff(&mut self, now: Instant, min: Duration, max: Duration) {
        self.backoff_window = match self.backoff_window.as_micros() {
            0 => min,
            _ => (self.backoff_window * 2).min(max),
        };
        self.backoff_until = Some(now + self.backoff_window);

        logging::debug!(self.log, "peer entering backoff";
                        "context" => "backoff",
                        "window_us" => self.backoff_window.as_micros() as u64);
    }

    /// Clears an expired deadline. Returns true when the deadline lapsed.
    pub fn expire_backoff(&mut self, now: Instant) -> bool {
        match self.backoff_until {
            Some(deadline) if now >= deadline => {
                self.backoff_until = None;
                true
            }
            _ => false,
        }
    }

    /// Forgets the escalation history after traffic flows cleanly again.
    #[inline]
    pub fn settle_backoff(&mut self) {
        self.backoff_window = Duration::from_micros(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone::logging;

    fn peer() -> Peer {
        let name = EpName {
            slid: 1,
            qpn: 2,
            nonce: 3,
        };
        Peer::new(RemoteAddr(0), name, false, logging::discard())
    }

    #[test]
    fn test_credits_all_or_nothing() {
        let mut peer = peer();
        peer.tx_credits = 10;

        assert!(!peer.take_credits(11));
        assert_eq!(peer.tx_credits, 10);

        assert!(peer.take_credits(10));
        assert_eq!(peer.tx_credits, 0);

        peer.refund_credits(4);
        assert_eq!(peer.tx_credits, 4);
    }

    #[test]
    fn test_backoff_escalates_and_expires() {
        let mut peer = peer();
        let min = Duration::from_micros(100);
        let max = Duration::from_micros(350);
        let now = Instant::now();

        peer.enter_backoff(now, min, max);
        assert!(peer.in_backoff(now));
        assert!(!peer.in_backoff(now + Duration::from_micros(100)));

        peer.enter_backoff(now, min, max);
        assert!(peer.in_backoff(now + Duration::from_micros(150)));

        // Window saturates at max
        peer.enter_backoff(now, min, max);
        peer.enter_backoff(now, min, max);
        assert!(!peer.in_backoff(now + Duration::from_micros(350)));

        assert!(peer.expire_backoff(now + Duration::from_secs(1)));
        assert!(!peer.in_backoff(now + Duration::from_secs(1)));

        peer.settle_backoff();
        peer.enter_backoff(now, min, max);
        assert!(!peer.in_backoff(now + min));
    }

    #[test]
    fn test_outstanding_counters_per_transport() {
        let mut peer = peer();

        peer.bump_outstanding(TransportKind::Nic);
        peer.bump_outstanding(TransportKind::Nic);
        peer.bump_outstanding(TransportKind::Shm);

        assert_eq!(peer.outstanding(TransportKind::Nic), 2);
        assert_eq!(peer.outstanding(TransportKind::Shm), 1);

        peer.drop_outstanding(TransportKind::Nic);
        assert_eq!(peer.outstanding(TransportKind::Nic), 1);
    }
}
