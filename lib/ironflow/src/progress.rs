//! The cooperative progress engine. One tick drains completions, replenishes
//! receive buffers, expires backoff, replays queued work in order and
//! flushes batched sends. Every step is bounded.

use crate::endpoint::EndpointCore;
use crate::entry::{EntryRef, Proto, RxState, TxState};
use crate::transport::{wr, TransportKind};
use lodestone::logging;
use lodestone::shared::{ErrorUtils, XferError};
use std::time::{Duration, Instant};

/// Which per-peer queue pair a replay pass walks.
#[derive(Copy, Clone, Eq, PartialEq)]
enum ReplayPass {
    Rnr,
    Ctrl,
}

impl EndpointCore {
    pub(crate) fn progress_tick(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }

        // First tick: one chunk for every receive pool, spreading the
        // registration cost away from construction.
        if !self.started {
            self.started = true;

            if self.nic.rx_pkts.grow(self.registrar.as_mut()).has_failed() {
                logging::warn!(self.log, "receive chunk registration failed, running unregistered";
                               "context" => "progress");
            }
            if let Some(lane) = self.shm.as_mut() {
                let _ = lane.rx_pkts.grow(self.registrar.as_mut());
            }

            logging::debug!(self.log, "receive pools primed";
                            "context" => "progress",
                            "nic_capacity" => self.nic.rx_pkts.capacity());
        }

        self.watchdog(now);

        self.drain_cq(TransportKind::Nic, now);
        if self.shm.is_some() {
            self.drain_cq(TransportKind::Shm, now);
        }

        self.replenish_recvs(TransportKind::Nic);
        if self.shm.is_some() {
            self.replenish_recvs(TransportKind::Shm);
        }

        let addrs = self.av.as_ref().expect("address vector bound").addrs();

        for &addr in &addrs {
            self.peer_mut(addr).expire_backoff(now);
        }

        // Queued handshakes: transient push-back stops the pass, anything
        // worse isolates the peer.
        for &addr in &addrs {
            let wants = {
                let peer = self.peer_mut(addr);
                !peer.failed && peer.handshake_queued && !peer.in_backoff(now)
            };
            if !wants {
                continue;
            }
            if self.send_handshake(addr) == Err(XferError::Again) {
                break;
            }
        }

        for &addr in &addrs {
            self.replay_peer(addr, now, ReplayPass::Rnr);
        }

        self.replay_loose_ctrl();
        for &addr in &addrs {
            self.replay_peer(addr, now, ReplayPass::Ctrl);
        }

        self.fill_windows(now);
        self.post_pending_reads();
        self.flush_lanes();
    }

    /// Safety valve on the grant quota: a long stretch of exhaustion points
    /// at leaked accounting, so the quota is reset loudly rather than left
    /// wedged.
    fn watchdog(&mut self, now: Instant) {
        if self.available_rx_bufs > 0 {
            self.bufs_exhausted_since = None;
            return;
        }

        let interval = Duration::from_millis(self.cfg.watchdog_interval_ms);
        match self.bufs_exhausted_since {
            None => self.bufs_exhausted_since = Some(now),
            Some(since) if now.duration_since(since) >= interval => {
                self.available_rx_bufs = self.cfg.available_rx_bufs;
                self.watchdog_resets += 1;
                self.bufs_exhausted_since = None;

                logging::error!(self.log, "receive buffer quota wedged, forcibly reset";
                                "context" => "watchdog",
                                "stuck_ms" => now.duration_since(since).as_millis() as u64,
                                "resets" => self.watchdog_resets);
            }
            Some(_) => {}
        }
    }

    /// Tops the wildcard receive ring back up to the configured depth,
    /// batching the doorbell across the posts. In zero-copy mode the NIC ring
    /// stays empty: arrivals must land in user buffers posted in order.
    fn replenish_recvs(&mut self, kind: TransportKind) {
        if kind == TransportKind::Nic && self.cfg.zero_copy_recv {
            return;
        }

        let posted = self.lane_mut(kind).posted_rx as usize;
        let need = self.cfg.rx_post_depth.saturating_sub(posted);
        if need > 0 {
            self.bulk_post_internal_recv(need, kind);
        }
    }

    /// Replays one peer's queued entries, receive side first, preserving
    /// enqueue order. A peer in backoff is skipped wholesale.
    fn replay_peer(&mut self, addr: crate::resolve::RemoteAddr, now: Instant, pass: ReplayPass) {
        {
            let peer = self.peer_mut(addr);
            if peer.failed || peer.in_backoff(now) {
                return;
            }
        }

        // Receive entries.
        let budget = self.peer_queue_len(addr, pass, false);
        for _ in 0..budget {
            let front = {
                let peer = self.peer_mut(addr);
                let queue = match pass {
                    ReplayPass::Rnr => &mut peer.rx_rnr,
                    ReplayPass::Ctrl => &mut peer.rx_ctrl,
                };
                queue.pop_front()
            };

            let rx = match front {
                Some(rx) => rx,
                None => break,
            };

            match self.replay_queued(EntryRef::Rx(rx)) {
                Ok(()) => {
                    if pass == ReplayPass::Ctrl {
                        self.resume_rx_ctrl(rx);
                    }
                }
                Err(XferError::Again) => {
                    let peer = self.peer_mut(addr);
                    let queue = match pass {
                        ReplayPass::Rnr => &mut peer.rx_rnr,
                        ReplayPass::Ctrl => &mut peer.rx_ctrl,
                    };
                    queue.push_front(rx);
                    return;
                }
                Err(_) => {}
            }
        }

        // Transmit entries.
        let budget = self.peer_queue_len(addr, pass, true);
        for _ in 0..budget {
            let front = {
                let peer = self.peer_mut(addr);
                let queue = match pass {
                    ReplayPass::Rnr => &mut peer.tx_rnr,
                    ReplayPass::Ctrl => &mut peer.tx_ctrl,
                };
                queue.pop_front()
            };

            let tx = match front {
                Some(tx) => tx,
                None => break,
            };

            match self.replay_queued(EntryRef::Tx(tx)) {
                Ok(()) => {
                    if pass == ReplayPass::Ctrl {
                        self.resume_tx_ctrl(tx);
                    }
                }
                Err(XferError::Again) => {
                    let peer = self.peer_mut(addr);
                    let queue = match pass {
                        ReplayPass::Rnr => &mut peer.tx_rnr,
                        ReplayPass::Ctrl => &mut peer.tx_ctrl,
                    };
                    queue.push_front(tx);
                    return;
                }
                Err(_) => {}
            }
        }
    }

    fn peer_queue_len(&mut self, addr: crate::resolve::RemoteAddr, pass: ReplayPass, tx: bool) -> usize {
        let peer = self.peer_mut(addr);
        match (pass, tx) {
            (ReplayPass::Rnr, false) => peer.rx_rnr.len(),
            (ReplayPass::Rnr, true) => peer.tx_rnr.len(),
            (ReplayPass::Ctrl, false) => peer.rx_ctrl.len(),
            (ReplayPass::Ctrl, true) => peer.tx_ctrl.len(),
        }
    }

    /// A control-queued transmit entry whose packets have all replayed may
    /// still owe its first packet: the pool or the credits were short at
    /// submit time.
    fn resume_tx_ctrl(&mut self, tx: crate::entry::TxId) {
        let proto = {
            match self.tx_entries.get(tx.0) {
                Some(entry) => {
                    let idle = entry.state == TxState::Req
                        && entry.bytes_sent == 0
                        && entry.outstanding == 0
                        && entry.queued_pkts.is_empty()
                        && !entry.failed;
                    match idle {
                        true => Some(entry.proto),
                        false => None,
                    }
                }
                None => None,
            }
        };

        match proto {
            Some(Proto::Eager) => self.tx_eager(tx),
            Some(Proto::LongCts) => self.tx_long_init(tx),
            Some(Proto::LongRead) => self.resend_read_rts(tx),
            None => {}
        }
    }

    /// A control-queued receive entry with drained packets may still owe a
    /// control packet that could not even be built: the window grant, or the
    /// terminal receipt/end-of-read notice.
    fn resume_rx_ctrl(&mut self, rx: crate::entry::RxId) {
        enum Owes {
            Grant,
            Terminal,
        }

        let (owes, kind) = {
            match self.rx_entries.get(rx.0) {
                Some(entry) => {
                    let owes = if entry.state != RxState::Recv || entry.failed {
                        None
                    } else if entry.bytes_received >= entry.expected_len && entry.send_receipt {
                        Some(Owes::Terminal)
                    } else if entry.window_open == 0
                        && entry.bytes_received < entry.expected_len
                        && entry.read_segs.is_empty()
                    {
                        Some(Owes::Grant)
                    } else {
                        None
                    };
                    (owes, entry.transport)
                }
                None => (None, TransportKind::Nic),
            }
        };

        match owes {
            Some(Owes::Grant) => self.grant_window(rx, kind, u32::max_value()),
            Some(Owes::Terminal) => {
                self.push_terminal_ctrl(rx, kind);
                if self.rx_entries.get(rx.0).map(|entry| entry.is_complete()).unwrap_or(false) {
                    self.deliver_rx(rx);
                }
            }
            None => {}
        }
    }

    /// Services every pending long transfer in arrival order until windows,
    /// quotas or pools run dry.
    fn fill_windows(&mut self, now: Instant) {
        let mut index = 0;
        while index < self.tx_pending.len() {
            let tx = self.tx_pending[index];
            let done = self.tx_fill_window(tx, now);

            if done {
                // The slot may already be gone if the entry was released
                // mid-service.
                if self.tx_pending.get(index).copied() == Some(tx) {
                    self.tx_pending.remove(index);
                }
            } else {
                index += 1;
            }
        }
    }

    /// Posts one-sided reads for everything on the read list. A transient
    /// refusal leaves the rest queued for the next tick.
    fn post_pending_reads(&mut self) {
        let budget = self.read_pending.len();

        for _ in 0..budget {
            let eref = match self.read_pending.pop_front() {
                Some(eref) => eref,
                None => break,
            };

            match eref {
                EntryRef::Tx(tx) => {
                    let spec = {
                        match self.tx_entries.get(tx.0) {
                            Some(entry) => Some((
                                entry.transport,
                                entry.dest,
                                entry.rma.expect("read carries target coordinates"),
                                entry.total_len,
                            )),
                            None => None,
                        }
                    };

                    let (kind, dest, rma, len) = match spec {
                        Some(spec) => spec,
                        None => continue,
                    };

                    let source = self.peer_mut(dest).name.source();
                    let lane = match kind {
                        TransportKind::Nic => &mut self.nic,
                        TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
                    };

                    match lane.tr.post_read(source, rma.key, rma.offset, len, None, wr::read_tx(tx)) {
                        Ok(()) => {
                            let entry = self.tx_entries.get_mut(tx.0).expect("entry");
                            entry.outstanding += 1;
                            entry.state = TxState::Send;
                        }
                        Err(XferError::Again) => {
                            self.read_pending.push_back(EntryRef::Tx(tx));
                            return;
                        }
                        Err(XferError::Fault(fault)) => self.fail_tx(tx, fault, 0),
                    }
                }
                EntryRef::Rx(rx) => {
                    if !self.post_rx_reads(rx) {
                        return;
                    }
                }
            }
        }
    }

    /// Posts the remaining rendezvous segments of one receive entry.
    /// Returns false when the transport pushed back and the pass should end.
    fn post_rx_reads(&mut self, rx: crate::entry::RxId) -> bool {
        loop {
            let next = {
                match self.rx_entries.get(rx.0) {
                    Some(entry) => {
                        if entry.read_posted >= entry.read_segs.len() {
                            return true;
                        }
                        Some((
                            entry.transport,
                            entry.peer.expect("matched receive has a peer"),
                            entry.read_segs[entry.read_posted],
                            entry.read_posted,
                        ))
                    }
                    None => return true,
                }
            };

            let (kind, peer_addr, (key, len), seg) = match next {
                Some(next) => next,
                None => return true,
            };

            let source = self.peer_mut(peer_addr).name.source();
            let lane = match kind {
                TransportKind::Nic => &mut self.nic,
                TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
            };

            match lane.tr.post_read(source, key, 0, len as usize, None, wr::read_rx(rx, seg as u32)) {
                Ok(()) => {
                    let entry = self.rx_entries.get_mut(rx.0).expect("entry");
                    entry.outstanding += 1;
                    entry.read_posted += 1;
                }
                Err(XferError::Again) => {
                    self.read_pending.push_back(EntryRef::Rx(rx));
                    return false;
                }
                Err(XferError::Fault(fault)) => {
                    self.fail_rx(rx, fault, 0);
                    return true;
                }
            }
        }
    }

    /// Replays entry-less control packets in insertion order.
    fn replay_loose_ctrl(&mut self) {
        let budget = self.ctrl_queue.len();

        for _ in 0..budget {
            let (kind, pkt) = match self.ctrl_queue.pop_front() {
                Some(item) => item,
                None => break,
            };

            match self.send_pkt(kind, pkt, false) {
                Ok(()) => {}
                Err(XferError::Again) => {
                    self.ctrl_queue.push_front((kind, pkt));
                    return;
                }
                Err(fault) => {
                    self.lane_mut(kind).tx_pkts.release(pkt);
                    logging::error!(self.log, "queued control packet dropped";
                                    "context" => "replay_ctrl",
                                    "fault" => ?fault);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testkit::harness::{pair, HarnessOpts};
    use std::time::{Duration, Instant};

    #[test]
    fn test_first_tick_grows_receive_pools_once() {
        let (a, _b, _a_on_b, _b_on_a, _fabric) = pair(HarnessOpts::default());

        // The harness already ran the first tick.
        let after_first = a.with_core(|core| core.nic.rx_pkts.chunk_count());
        assert_eq!(after_first, 1);

        a.progress();
        a.progress();
        assert_eq!(a.with_core(|core| core.nic.rx_pkts.chunk_count()), 1);
    }

    #[test]
    fn test_receive_ring_stays_replenished() {
        let (a, _b, _a_on_b, _b_on_a, fabric) = pair(HarnessOpts::default());

        let depth = a.with_core(|core| core.cfg.rx_post_depth);
        assert_eq!(fabric.nic.posted_recvs(fabric.a_name.source()), depth);
    }

    #[test]
    fn test_watchdog_resets_wedged_quota() {
        let (a, _b, _a_on_b, _b_on_a, _fabric) = pair(HarnessOpts::default());

        let interval = a.with_core(|core| {
            core.available_rx_bufs = 0;
            Duration::from_millis(core.cfg.watchdog_interval_ms)
        });

        let t0 = Instant::now();
        a.progress_at(t0);
        assert_eq!(a.watchdog_resets(), 0);

        a.progress_at(t0 + interval + Duration::from_millis(1));
        assert_eq!(a.watchdog_resets(), 1);

        let restored = a.with_core(|core| (core.available_rx_bufs, core.cfg.available_rx_bufs));
        assert_eq!(restored.0, restored.1);
    }

    #[test]
    fn test_outstanding_quota_leaves_later_entries_untouched() {
        let (a, b, _a_on_b, b_on_a, fabric) = pair(HarnessOpts {
            max_outstanding: 4,
            ..HarnessOpts::default()
        });

        let mut view = fabric.registrar();
        let key_one = view.expose(&vec![0u8; 64 * 1024]);
        let key_two = view.expose(&vec![0u8; 64 * 1024]);

        a.write(b_on_a, vec![vec![1u8; 64 * 1024]], key_one, 0, 1, 0, 0).unwrap();
        a.write(b_on_a, vec![vec![2u8; 64 * 1024]], key_two, 0, 2, 0, 0).unwrap();

        // One tick: the first transfer eats the whole quota, the second is
        // left alone without any error.
        a.progress();
        a.with_core(|core| {
            let first = core.tx_entries.get(0).unwrap();
            let second = core.tx_entries.get(1).unwrap();
            assert!(first.bytes_sent > 0);
            assert!(first.bytes_sent < first.total_len);
            assert_eq!(second.bytes_sent, 0);
        });
        assert!(a.read_cq_err(8).is_empty());

        // Both finish eventually.
        for _ in 0..80 {
            a.progress();
            b.progress();
            if a.with_core(|core| core.tx_entries.in_use()) == 0 {
                break;
            }
        }
        assert_eq!(a.read_cq(8).len(), 2);
    }
}

