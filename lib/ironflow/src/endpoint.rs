use crate::comp::{flags, CompErr, CompErrKind, Completion, CompletionQueue, Counter, Event, EventQueue};
use crate::config::EndpointConfig;
use crate::entry::{
    iov_len, AtomicSpec, CompDesc, EntryRef, MultiState, RmaSpec, RxEntry, RxId, RxState, TxEntry,
    TxId, TxOp, IOV_LIMIT,
};
use crate::mr::MemoryRegistrar;
use crate::peer::Peer;
use crate::pool::{PktPool, SlotPool};
use crate::resolve::{AddressVector, EpName, RemoteAddr};
use crate::transport::{Transport, TransportKind};
use crate::wire::{AtomicKind, FEAT_CONST_HDR, FEAT_DELIVERY_COMPLETE, FEAT_READ};
use lodestone::logging;
use lodestone::shared::{ErrorUtils, FaultKind, XferError, XferResult};
use lodestone::time::unix_secs;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// One transport plus the packet pools feeding it. Transmit pools back
/// outbound frames, receive pools back the wildcard receive ring.
pub(crate) struct Lane {
    pub tr: Box<dyn Transport>,
    pub tx_pkts: PktPool,
    pub rx_pkts: PktPool,
    /// Internal receive buffers currently posted.
    pub posted_rx: u32,
    /// Sends handed to the transport and not yet completed.
    pub outstanding: u32,
    /// Sends batched behind the more-to-come flag since the last doorbell.
    pub more_pending: bool,
}

impl Lane {
    fn new(tr: Box<dyn Transport>, cfg: &EndpointConfig, register: bool) -> Lane {
        Lane {
            tr,
            tx_pkts: PktPool::new(cfg.mtu, cfg.pkt_chunk, register),
            rx_pkts: PktPool::new(cfg.mtu, cfg.pkt_chunk, register),
            posted_rx: 0,
            outstanding: 0,
            more_pending: false,
        }
    }
}

/// Counts reported by `close` after walking every list for stragglers.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct CloseReport {
    pub tx_orphans: usize,
    pub rx_orphans: usize,
    pub pkt_leaks: usize,
}

/// The single-threaded endpoint state. All mutation happens under the
/// owning `Endpoint` lock.
pub(crate) struct EndpointCore {
    pub cfg: EndpointConfig,
    pub log: logging::Logger,

    pub nic: Lane,
    pub shm: Option<Lane>,
    pub registrar: Box<dyn MemoryRegistrar>,

    pub av: Option<AddressVector>,
    pub cq: CompletionQueue,
    pub tx_cntr: Counter,
    pub rx_cntr: Counter,
    pub eq: EventQueue,

    pub tx_entries: SlotPool<TxEntry>,
    pub rx_entries: SlotPool<RxEntry>,

    // Untagged and tagged receive lists. Entries stay linked from post until
    // release so cancellation can find mid-receive entries.
    pub recv_list: VecDeque<RxId>,
    pub trecv_list: VecDeque<RxId>,
    pub unexp_list: VecDeque<RxId>,
    pub unexp_tlist: VecDeque<RxId>,

    /// Long sends holding positive window, serviced by the progress engine.
    pub tx_pending: VecDeque<TxId>,
    /// Entries waiting to post one-sided reads.
    pub read_pending: VecDeque<EntryRef>,
    /// Entry-less control packets bounced by the transport, replayed in
    /// insertion order.
    pub ctrl_queue: VecDeque<(TransportKind, crate::pool::PktId)>,

    pub name: Option<EpName>,
    pub shm_name: Option<String>,
    pub features: u64,
    pub enabled: bool,
    /// First progress tick performed (receive pools grown).
    pub started: bool,

    pub min_multi_recv: usize,

    /// Receive-buffer quota backing flow-control grants.
    pub available_rx_bufs: usize,
    pub bufs_exhausted_since: Option<Instant>,
    pub watchdog_resets: u64,
}

impl EndpointCore {
    fn new(
        cfg: EndpointConfig,
        nic: Box<dyn Transport>,
        shm: Option<Box<dyn Transport>>,
        registrar: Box<dyn MemoryRegistrar>,
        log: logging::Logger,
    ) -> XferResult<EndpointCore> {
        cfg.validate()?;

        let cq = CompletionQueue::new(cfg.cq_capacity, log.new(logging::o!("unit" => "cq")));

        Ok(EndpointCore {
            nic: Lane::new(nic, &cfg, true),
            shm: shm.map(|tr| Lane::new(tr, &cfg, false)),
            registrar,
            av: None,
            cq,
            tx_cntr: Counter::default(),
            rx_cntr: Counter::default(),
            eq: EventQueue::new(),
            tx_entries: SlotPool::new(cfg.tx_entry_chunk),
            rx_entries: SlotPool::new(cfg.rx_entry_chunk),
            recv_list: VecDeque::new(),
            trecv_list: VecDeque::new(),
            unexp_list: VecDeque::new(),
            unexp_tlist: VecDeque::new(),
            tx_pending: VecDeque::new(),
            read_pending: VecDeque::new(),
            ctrl_queue: VecDeque::new(),
            name: None,
            shm_name: None,
            features: 0,
            enabled: false,
            started: false,
            min_multi_recv: cfg.min_multi_recv,
            available_rx_bufs: cfg.available_rx_bufs,
            bufs_exhausted_since: None,
            watchdog_resets: 0,
            log,
            cfg,
        })
    }

    #[inline]
    pub fn lane_mut(&mut self, kind: TransportKind) -> &mut Lane {
        match kind {
            TransportKind::Nic => &mut self.nic,
            TransportKind::Shm => self.shm.as_mut().expect("shm lane enabled"),
        }
    }

    #[inline]
    pub fn av_mut(&mut self) -> &mut AddressVector {
        self.av.as_mut().expect("address vector bound")
    }

    #[inline]
    pub fn peer_mut(&mut self, addr: RemoteAddr) -> &mut Peer {
        self.av
            .as_mut()
            .expect("address vector bound")
            .peer_mut(addr)
            .expect("peer resolved")
    }

    // ---- lifecycle -------------------------------------------------------

    fn bind_av(&mut self, av: AddressVector) {
        self.av = Some(av);
    }

    /// Brings both transports up. Requires a bound address vector. The local
    /// raw name is read back from the NIC and the shared-memory name is
    /// derived from it.
    fn enable(&mut self) -> XferResult<()> {
        if self.av.is_none() {
            return Err(XferError::Fault(FaultKind::NotEnabled));
        }

        if self.cfg.mtu > self.nic.tr.mtu() {
            return Err(XferError::Fault(FaultKind::Config));
        }

        let name = self.nic.tr.enable()?;

        self.features = FEAT_DELIVERY_COMPLETE;
        if self.nic.tr.supports_read() {
            self.features |= FEAT_READ;
        }
        if self.cfg.zero_copy_recv {
            self.features |= FEAT_CONST_HDR;
        }

        if let Some(lane) = self.shm.as_mut() {
            lane.tr.enable()?;
            self.shm_name = Some(name.shm_name());
        }

        // Entry pools and transmit packet pools get their first chunk here.
        // Receive pools wait for the first progress tick.
        self.tx_entries.grow();
        self.rx_entries.grow();

        if self.nic.tx_pkts.grow(self.registrar.as_mut()).has_failed() {
            logging::warn!(self.log, "transmit chunk registration failed, running unregistered";
                           "context" => "enable");
        }
        if let Some(lane) = self.shm.as_mut() {
            let _ = lane.tx_pkts.grow(self.registrar.as_mut());
        }

        self.name = Some(name);
        self.enabled = true;

        logging::info!(self.log, "endpoint enabled";
                       "context" => "enable",
                       "slid" => name.slid,
                       "qpn" => name.qpn,
                       "features" => self.features,
                       "shm" => self.shm.is_some());

        Ok(())
    }

    /// Tears everything down in reverse order of construction, warning for
    /// every entry still alive and reporting the counts.
    fn close(&mut self) -> CloseReport {
        self.nic.tr.shutdown();
        if let Some(lane) = self.shm.as_mut() {
            lane.tr.shutdown();
        }
        self.enabled = false;

        let mut report = CloseReport::default();

        for index in self.tx_entries.occupied_ids() {
            let entry = self.tx_entries.release(index);
            logging::warn!(self.log, "orphaned transmit entry at close";
                           "context" => "close",
                           "entry" => index,
                           "state" => ?entry.state,
                           "bytes_sent" => entry.bytes_sent as u64,
                           "bytes_acked" => entry.bytes_acked as u64);
            for handle in entry.prov_mrs {
                self.registrar.release(handle);
            }
            report.tx_orphans += 1;
        }

        for index in self.rx_entries.occupied_ids() {
            let entry = self.rx_entries.release(index);
            logging::warn!(self.log, "orphaned receive entry at close";
                           "context" => "close",
                           "entry" => index,
                           "state" => ?entry.state,
                           "bytes_received" => entry.bytes_received as u64);
            report.rx_orphans += 1;
        }

        report.pkt_leaks += self.nic.tx_pkts.reset_all();
        report.pkt_leaks += self.nic.rx_pkts.reset_all();
        self.nic.tx_pkts.release_registrations(self.registrar.as_mut());
        self.nic.rx_pkts.release_registrations(self.registrar.as_mut());
        self.nic.posted_rx = 0;
        self.nic.outstanding = 0;

        if let Some(lane) = self.shm.as_mut() {
            report.pkt_leaks += lane.tx_pkts.reset_all();
            report.pkt_leaks += lane.rx_pkts.reset_all();
            lane.posted_rx = 0;
            lane.outstanding = 0;
        }

        self.recv_list.clear();
        self.trecv_list.clear();
        self.unexp_list.clear();
        self.unexp_tlist.clear();
        self.tx_pending.clear();
        self.read_pending.clear();
        self.ctrl_queue.clear();

        if report != CloseReport::default() {
            logging::warn!(self.log, "endpoint closed with stragglers";
                           "context" => "close",
                           "tx_orphans" => report.tx_orphans,
                           "rx_orphans" => report.rx_orphans,
                           "pkt_leaks" => report.pkt_leaks);
        } else {
            logging::info!(self.log, "endpoint closed"; "context" => "close");
        }

        report
    }

    // ---- submission ------------------------------------------------------

    fn check_submit(&self, iov: &[Vec<u8>]) -> XferResult<()> {
        if !self.enabled {
            return Err(XferError::Fault(FaultKind::NotEnabled));
        }
        if iov.len() > IOV_LIMIT {
            return Err(XferError::Fault(FaultKind::TooManySegments));
        }
        Ok(())
    }

    /// Resolves and vets the destination, queueing a first-contact handshake
    /// as a side effect. Returns the transport the peer lives on.
    fn check_dest(&mut self, dest: RemoteAddr) -> XferResult<TransportKind> {
        let default_credits = self.cfg.peer_credits;
        let peer = self
            .av_mut()
            .peer_mut(dest)
            .ok_or(XferError::Fault(FaultKind::UnknownAddr))?;

        if peer.failed {
            return Err(XferError::Fault(FaultKind::PeerFailed));
        }

        if !peer.handshake_sent && !peer.handshake_queued {
            peer.handshake_queued = true;
            // Until the remote's handshake arrives, assume the configured
            // default credit pool.
            peer.tx_credits = default_credits;
        }

        Ok(peer.transport())
    }

    fn submit_tx(
        &mut self,
        op: TxOp,
        dest: RemoteAddr,
        iov: Vec<Vec<u8>>,
        tag: u64,
        context: u64,
        user_flags: u64,
        data: u64,
        rma: Option<RmaSpec>,
        atomic: Option<AtomicSpec>,
    ) -> XferResult<()> {
        self.check_submit(&iov)?;
        let kind = self.check_dest(dest)?;

        let mut comp_flags = match op {
            TxOp::Msg => flags::SEND | flags::MSG,
            TxOp::Tagged => flags::SEND | flags::TAGGED,
            TxOp::Write => flags::RMA | flags::WRITE,
            TxOp::Read => flags::RMA | flags::READ,
            TxOp::Atomic => flags::ATOMIC,
            TxOp::FetchAtomic | TxOp::CompareAtomic => flags::ATOMIC | flags::READ,
        };
        if user_flags & flags::REMOTE_CQ_DATA != 0 {
            comp_flags |= flags::REMOTE_CQ_DATA;
        }
        if user_flags & flags::DELIVERY_COMPLETE != 0 {
            comp_flags |= flags::DELIVERY_COMPLETE;
        }

        let total_len = iov_len(&iov);
        // Atomic lanes are a u64 wide whether or not the op fetches.
        let comp_len = match op {
            TxOp::Atomic => 8,
            _ => total_len,
        };
        let comp = CompDesc {
            context,
            flags: comp_flags,
            data,
            len: comp_len,
            tag,
        };

        let mut entry = TxEntry::new(TxId(0), op, dest, iov, comp);
        entry.transport = kind;
        entry.rma = rma;
        entry.atomic = atomic;
        entry.needs_receipt = user_flags & flags::DELIVERY_COMPLETE != 0;

        let index = match self.tx_entries.acquire(entry) {
            Some(index) => index,
            None => return Err(XferError::Again),
        };
        let tx = TxId(index);
        self.tx_entries.get_mut(index).expect("fresh entry").index = tx;

        logging::trace!(self.log, "transmit entry submitted";
                        "context" => "submit",
                        "entry" => index,
                        "op" => ?op,
                        "dest" => dest.0,
                        "total_len" => total_len as u64);

        self.start_tx(tx);
        Ok(())
    }

    fn submit_rx(
        &mut self,
        src: Option<RemoteAddr>,
        iov: Vec<Vec<u8>>,
        tagged: bool,
        tag: u64,
        ignore: u64,
        context: u64,
        user_flags: u64,
    ) -> XferResult<()> {
        self.check_submit(&iov)?;

        if let Some(src) = src {
            if !self.av.as_ref().map(|av| av.contains(src)).unwrap_or(false) {
                return Err(XferError::Fault(FaultKind::UnknownAddr));
            }
        }

        let comp_flags = flags::RECV | if tagged { flags::TAGGED } else { flags::MSG };
        let total_len = iov_len(&iov);
        let comp = CompDesc {
            context,
            flags: comp_flags,
            data: 0,
            len: total_len,
            tag,
        };

        let mut entry = RxEntry::new(RxId(0), src, iov, tagged, tag, ignore, comp);
        if user_flags & flags::MULTI_RECV != 0 {
            entry.multi = Some(MultiState {
                remaining: total_len,
                consumers: 0,
                cancelled: false,
            });
        }

        let index = match self.rx_entries.acquire(entry) {
            Some(index) => index,
            None => return Err(XferError::Again),
        };
        let rx = RxId(index);
        self.rx_entries.get_mut(index).expect("fresh entry").index = rx;

        match tagged {
            true => self.trecv_list.push_back(rx),
            false => self.recv_list.push_back(rx),
        }

        logging::trace!(self.log, "receive entry posted";
                        "context" => "submit",
                        "entry" => index,
                        "tagged" => tagged,
                        "total_len" => total_len as u64);

        if !self.match_unexpected(rx)
            && self.cfg.zero_copy_recv
            && self.features & crate::wire::FEAT_CONST_HDR != 0
            && !tagged
            && src.is_none()
            && user_flags & flags::MULTI_RECV == 0
            && self.post_user_recv(rx).has_failed()
        {
            logging::warn!(self.log, "direct receive post failed, entry falls back to provider buffers";
                           "context" => "submit",
                           "entry" => index);
        }

        Ok(())
    }

    // ---- cancellation ----------------------------------------------------

    /// Cancels the first posted receive carrying `context`. Entries already
    /// receiving are only suppressed: later arrivals are discarded and no
    /// completion of any kind is written.
    fn cancel(&mut self, context: u64) -> bool {
        for tagged in &[false, true] {
            let list = match tagged {
                true => &self.trecv_list,
                false => &self.recv_list,
            };

            let found = list.iter().copied().find(|&rx| {
                self.rx_entries
                    .get(rx.0)
                    .map(|entry| entry.comp.context == context && !entry.cancel_suppressed)
                    .unwrap_or(false)
            });

            let rx = match found {
                Some(rx) => rx,
                None => continue,
            };

            let entry = self.rx_entries.get_mut(rx.0).expect("listed entry");

            if let Some(multi) = entry.multi.as_mut() {
                if multi.consumers > 0 {
                    // Defer the final completion until the last consumer is
                    // done.
                    multi.cancelled = true;
                    let list = match tagged {
                        true => &mut self.trecv_list,
                        false => &mut self.recv_list,
                    };
                    list.retain(|&id| id != rx);
                    return true;
                }

                self.deliver_multi_final(rx);
                return true;
            }

            match entry.state {
                RxState::Recv => {
                    entry.cancel_suppressed = true;
                }
                _ => {
                    // A zero-copy post keeps the slot alive until its buffer
                    // completes; the canceled completion is written now either
                    // way, and no arrival will match the entry again.
                    let (context, comp_flags) = (entry.comp.context, entry.comp.flags);
                    match entry.outstanding {
                        0 => {
                            self.release_rx(rx);
                        }
                        _ => {
                            entry.failed = true;
                            entry.cancel_suppressed = true;
                            entry.state = RxState::Recv;
                        }
                    }

                    self.cq.push_err(CompErr {
                        context,
                        flags: comp_flags,
                        kind: CompErrKind::Canceled,
                        prov_code: 0,
                        buf: None,
                    });
                    self.rx_cntr.add_err();
                }
            }

            logging::debug!(self.log, "receive cancelled";
                            "context" => "cancel",
                            "entry" => rx.0,
                            "cq_context" => context);
            return true;
        }

        false
    }

    // ---- completion plumbing --------------------------------------------

    fn comp_buf(iov: Vec<Vec<u8>>, len: usize) -> Option<Vec<Vec<u8>>> {
        match len {
            0 => None,
            _ => Some(iov),
        }
    }

    /// Removes the entry from every endpoint list and returns it to the pool.
    pub fn release_tx(&mut self, tx: TxId) -> TxEntry {
        self.tx_pending.retain(|&id| id != tx);
        self.read_pending.retain(|&eref| eref != EntryRef::Tx(tx));

        let entry = self.tx_entries.release(tx.0);
        for handle in entry.prov_mrs.iter().copied() {
            self.registrar.release(handle);
        }
        entry
    }

    pub fn release_rx(&mut self, rx: RxId) -> RxEntry {
        self.recv_list.retain(|&id| id != rx);
        self.trecv_list.retain(|&id| id != rx);
        self.unexp_list.retain(|&id| id != rx);
        self.unexp_tlist.retain(|&id| id != rx);
        self.read_pending.retain(|&eref| eref != EntryRef::Rx(rx));

        self.rx_entries.release(rx.0)
    }

    /// Writes the terminal user completion and releases the entry. The peer
    /// gets its transfer credits back.
    pub fn deliver_tx(&mut self, tx: TxId) {
        let entry = self.release_tx(tx);

        let dest = entry.dest;
        let refund = entry.credit_request;
        if let Some(peer) = self.av_mut().peer_mut(dest) {
            peer.refund_credits(refund);
        }

        logging::trace!(self.log, "transmit complete";
                        "context" => "deliver_tx",
                        "entry" => tx.0,
                        "len" => entry.comp.len as u64);

        self.cq.push(Completion {
            context: entry.comp.context,
            flags: entry.comp.flags,
            len: entry.comp.len,
            data: entry.comp.data,
            tag: entry.comp.tag,
            buf: Self::comp_buf(entry.iov, entry.comp.len),
        });
        self.tx_cntr.add();
    }

    /// Terminal fault on a transmit entry: the error completion is written
    /// immediately; the entry itself lingers until every outstanding packet
    /// has completed.
    pub fn fail_tx(&mut self, tx: TxId, fault: FaultKind, prov_code: i32) {
        let entry = match self.tx_entries.get_mut(tx.0) {
            Some(entry) => entry,
            None => return,
        };

        if entry.failed {
            return;
        }
        entry.failed = true;

        let context = entry.comp.context;
        let comp_flags = entry.comp.flags;
        let outstanding = entry.outstanding;
        let dest = entry.dest;
        let refund = entry.credit_request;
        let kind = entry.transport;

        // Queued packets are dropped; they will never be replayed.
        let queued: Vec<_> = entry.queued_pkts.drain(..).collect();

        logging::debug!(self.log, "transmit entry failed";
                        "context" => "fail_tx",
                        "entry" => tx.0,
                        "fault" => ?fault,
                        "outstanding" => outstanding);

        let lane = self.lane_mut(kind);
        for pkt in queued {
            lane.tx_pkts.release(pkt);
        }

        if let Some(peer) = self.av_mut().peer_mut(dest) {
            peer.refund_credits(refund);
            peer.tx_rnr.retain(|&id| id != tx);
            peer.tx_ctrl.retain(|&id| id != tx);
        }

        self.cq.push_err(CompErr {
            context,
            flags: comp_flags,
            kind: CompErrKind::Fault(fault),
            prov_code,
            buf: None,
        });
        self.tx_cntr.add_err();

        if outstanding == 0 {
            self.release_tx(tx);
        }
    }

    /// Writes the receive completion (or the suppressed nothing) and releases
    /// the entry, folding multi-receive children back into their parent.
    pub fn deliver_rx(&mut self, rx: RxId) {
        let entry = self.release_rx(rx);

        if entry.cancel_suppressed {
            logging::trace!(self.log, "suppressed receive drained";
                            "context" => "deliver_rx", "entry" => rx.0);
            return;
        }

        logging::trace!(self.log, "receive complete";
                        "context" => "deliver_rx",
                        "entry" => rx.0,
                        "len" => entry.bytes_received as u64);

        let len = entry.bytes_received;
        self.cq.push(Completion {
            context: entry.comp.context,
            flags: entry.comp.flags,
            len,
            data: entry.comp.data,
            tag: entry.comp.tag,
            buf: Self::comp_buf(entry.iov, len),
        });
        self.rx_cntr.add();

        if let Some(parent) = entry.parent {
            self.consumer_done(parent);
        }
    }

    pub fn fail_rx(&mut self, rx: RxId, fault: FaultKind, prov_code: i32) {
        let entry = match self.rx_entries.get_mut(rx.0) {
            Some(entry) => entry,
            None => return,
        };

        if entry.failed {
            return;
        }
        entry.failed = true;

        let context = entry.comp.context;
        let comp_flags = entry.comp.flags;
        let outstanding = entry.outstanding;
        let peer = entry.peer;
        let parent = entry.parent;

        let queued: Vec<_> = entry.queued_pkts.drain(..).collect();
        let kind = entry.transport;

        logging::debug!(self.log, "receive entry failed";
                        "context" => "fail_rx",
                        "entry" => rx.0,
                        "fault" => ?fault);

        let lane = self.lane_mut(kind);
        for pkt in queued {
            lane.tx_pkts.release(pkt);
        }

        if let Some(addr) = peer {
            if let Some(peer) = self.av_mut().peer_mut(addr) {
                peer.rx_rnr.retain(|&id| id != rx);
                peer.rx_ctrl.retain(|&id| id != rx);
            }
        }

        self.cq.push_err(CompErr {
            context,
            flags: comp_flags,
            kind: CompErrKind::Fault(fault),
            prov_code,
            buf: None,
        });
        self.rx_cntr.add_err();

        if outstanding == 0 {
            self.release_rx(rx);
            if let Some(parent) = parent {
                self.consumer_done(parent);
            }
        }
    }

    /// One multi-receive consumer finished; the parent may now be due its
    /// final completion.
    pub fn consumer_done(&mut self, parent: RxId) {
        let entry = match self.rx_entries.get_mut(parent.0) {
            Some(entry) => entry,
            None => return,
        };

        let multi = entry.multi.as_mut().expect("multi-receive parent");
        multi.consumers -= 1;

        let finished = multi.consumers == 0 && (multi.cancelled || multi.remaining < self.min_multi_recv);
        if finished {
            self.deliver_multi_final(parent);
        }
    }

    /// Final multi-receive completion: returns the parent buffer and flags
    /// the completion so the user knows the buffer is theirs again.
    pub fn deliver_multi_final(&mut self, parent: RxId) {
        let entry = self.release_rx(parent);
        let multi = entry.multi.expect("multi-receive parent");

        let consumed = entry.total_len - multi.remaining;

        self.cq.push(Completion {
            context: entry.comp.context,
            flags: entry.comp.flags | flags::MULTI_RECV,
            len: consumed,
            data: 0,
            tag: 0,
            buf: Some(entry.iov),
        });
        self.rx_cntr.add();

        logging::debug!(self.log, "multi-receive buffer released";
                        "context" => "multi_recv",
                        "entry" => parent.0,
                        "consumed" => consumed as u64);
    }

    /// Isolates a peer after a terminal control-path fault. Everything queued
    /// against it completes in error; the event queue records the isolation.
    pub fn fail_peer(&mut self, addr: RemoteAddr, fault: FaultKind) {
        let peer = match self.av_mut().peer_mut(addr) {
            Some(peer) => peer,
            None => return,
        };

        peer.failed = true;
        peer.handshake_queued = false;

        let tx_queued: Vec<_> = peer.tx_rnr.drain(..).chain(peer.tx_ctrl.drain(..)).collect();
        let rx_queued: Vec<_> = peer.rx_rnr.drain(..).chain(peer.rx_ctrl.drain(..)).collect();

        logging::error!(peer.log, "peer isolated after terminal fault";
                        "context" => "fail_peer",
                        "fault" => ?fault);

        for tx in tx_queued {
            self.fail_tx(tx, FaultKind::PeerFailed, 0);
        }
        for rx in rx_queued {
            self.fail_rx(rx, FaultKind::PeerFailed, 0);
        }

        self.eq.push(Event::PeerFailed {
            addr,
            fault,
            at: unix_secs(),
        });
    }
}

/// The public endpoint handle. One coarse lock serializes every entry point
/// against the progress engine; there is no finer-grained locking anywhere
/// on the data path.
pub struct Endpoint {
    core: Mutex<EndpointCore>,
}

impl Endpoint {
    pub fn new(
        cfg: EndpointConfig,
        nic: Box<dyn Transport>,
        shm: Option<Box<dyn Transport>>,
        registrar: Box<dyn MemoryRegistrar>,
        log: logging::Logger,
    ) -> XferResult<Endpoint> {
        Ok(Endpoint {
            core: Mutex::new(EndpointCore::new(cfg, nic, shm, registrar, log)?),
        })
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, EndpointCore> {
        // The state is valid at every lock release point, so a poisoned lock
        // only means another thread panicked mid-tick.
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn bind_av(&self, av: AddressVector) {
        self.lock().bind_av(av)
    }

    pub fn enable(&self) -> XferResult<()> {
        self.lock().enable()
    }

    /// Inserts (or finds) a peer by raw name.
    pub fn av_insert(&self, name: EpName, node_local: bool) -> XferResult<RemoteAddr> {
        let mut core = self.lock();
        match core.av.as_mut() {
            Some(av) => Ok(av.insert(name, node_local)),
            None => Err(XferError::Fault(FaultKind::NotEnabled)),
        }
    }

    pub fn local_name(&self) -> Option<EpName> {
        self.lock().name
    }

    pub fn shm_name(&self) -> Option<String> {
        self.lock().shm_name.clone()
    }

    // ---- data path -------------------------------------------------------

    pub fn send(&self, dest: RemoteAddr, iov: Vec<Vec<u8>>, context: u64, user_flags: u64, data: u64) -> XferResult<()> {
        self.lock()
            .submit_tx(TxOp::Msg, dest, iov, 0, context, user_flags, data, None, None)
    }

    pub fn tsend(
        &self,
        dest: RemoteAddr,
        iov: Vec<Vec<u8>>,
        tag: u64,
        context: u64,
        user_flags: u64,
        data: u64,
    ) -> XferResult<()> {
        self.lock()
            .submit_tx(TxOp::Tagged, dest, iov, tag, context, user_flags, data, None, None)
    }

    pub fn recv(&self, src: Option<RemoteAddr>, iov: Vec<Vec<u8>>, context: u64, user_flags: u64) -> XferResult<()> {
        self.lock().submit_rx(src, iov, false, 0, 0, context, user_flags)
    }

    pub fn trecv(
        &self,
        src: Option<RemoteAddr>,
        iov: Vec<Vec<u8>>,
        tag: u64,
        ignore: u64,
        context: u64,
        user_flags: u64,
    ) -> XferResult<()> {
        self.lock().submit_rx(src, iov, true, tag, ignore, context, user_flags)
    }

    pub fn write(
        &self,
        dest: RemoteAddr,
        iov: Vec<Vec<u8>>,
        key: u64,
        offset: u64,
        context: u64,
        user_flags: u64,
        data: u64,
    ) -> XferResult<()> {
        self.lock().submit_tx(
            TxOp::Write,
            dest,
            iov,
            0,
            context,
            user_flags,
            data,
            Some(RmaSpec { key, offset }),
            None,
        )
    }

    /// One-sided read of `len` bytes from the peer's registered region into
    /// a freshly returned buffer.
    pub fn read(&self, dest: RemoteAddr, len: usize, key: u64, offset: u64, context: u64) -> XferResult<()> {
        self.lock().submit_tx(
            TxOp::Read,
            dest,
            vec![vec![0u8; len]],
            0,
            context,
            0,
            0,
            Some(RmaSpec { key, offset }),
            None,
        )
    }

    pub fn atomic(
        &self,
        dest: RemoteAddr,
        key: u64,
        offset: u64,
        kind: AtomicKind,
        operand: u64,
        context: u64,
    ) -> XferResult<()> {
        self.lock().submit_tx(
            TxOp::Atomic,
            dest,
            Vec::new(),
            0,
            context,
            0,
            0,
            Some(RmaSpec { key, offset }),
            Some(AtomicSpec {
                kind,
                operand,
                compare: 0,
            }),
        )
    }

    /// Fetching atomic: the prior value lands in the returned buffer.
    pub fn atomic_fetch(
        &self,
        dest: RemoteAddr,
        key: u64,
        offset: u64,
        kind: AtomicKind,
        operand: u64,
        context: u64,
    ) -> XferResult<()> {
        self.lock().submit_tx(
            TxOp::FetchAtomic,
            dest,
            vec![vec![0u8; 8]],
            0,
            context,
            0,
            0,
            Some(RmaSpec { key, offset }),
            Some(AtomicSpec {
                kind,
                operand,
                compare: 0,
            }),
        )
    }

    /// Atomic read: a fetch that applies no mutation.
    pub fn atomic_read(&self, dest: RemoteAddr, key: u64, offset: u64, context: u64) -> XferResult<()> {
        self.atomic_fetch(dest, key, offset, AtomicKind::Read, 0, context)
    }

    /// Compare-and-swap; the prior value lands in the returned buffer.
    pub fn atomic_compare(
        &self,
        dest: RemoteAddr,
        key: u64,
        offset: u64,
        desired: u64,
        compare: u64,
        context: u64,
    ) -> XferResult<()> {
        self.lock().submit_tx(
            TxOp::CompareAtomic,
            dest,
            vec![vec![0u8; 8]],
            0,
            context,
            0,
            0,
            Some(RmaSpec { key, offset }),
            Some(AtomicSpec {
                kind: AtomicKind::CompareSwap,
                operand: desired,
                compare,
            }),
        )
    }

    /// Cancels the first posted receive carrying `context`. Returns whether
    /// anything matched.
    pub fn cancel(&self, context: u64) -> bool {
        self.lock().cancel(context)
    }

    /// Drives the endpoint: drains completions, replenishes buffers, expires
    /// backoff, retries queued work and flushes batched sends.
    pub fn progress(&self) {
        self.lock().progress_tick(Instant::now());
    }

    #[cfg(test)]
    pub(crate) fn progress_at(&self, now: Instant) {
        self.lock().progress_tick(now);
    }

    pub fn read_cq(&self, max: usize) -> Vec<Completion> {
        self.lock().cq.read(max)
    }

    pub fn read_cq_err(&self, max: usize) -> Vec<CompErr> {
        self.lock().cq.read_err(max)
    }

    pub fn read_eq(&self) -> Vec<Event> {
        self.lock().eq.read()
    }

    /// (successes, errors) per direction: transmit then receive.
    pub fn counters(&self) -> (Counter, Counter) {
        let core = self.lock();
        (core.tx_cntr, core.rx_cntr)
    }

    pub fn min_multi_recv(&self) -> usize {
        self.lock().min_multi_recv
    }

    pub fn set_min_multi_recv(&self, threshold: usize) {
        self.lock().min_multi_recv = threshold;
    }

    pub fn watchdog_resets(&self) -> u64 {
        self.lock().watchdog_resets
    }

    pub fn close(&self) -> CloseReport {
        self.lock().close()
    }

    #[cfg(test)]
    pub(crate) fn with_core<R>(&self, body: impl FnOnce(&mut EndpointCore) -> R) -> R {
        body(&mut self.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comp::flags;
    use crate::testkit::harness::{drain_one, pair, HarnessOpts};
    use crate::wire::AtomicKind;
    use std::convert::TryInto;
    use std::time::Duration;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    #[test]
    fn test_eager_send_single_packet() {
        let (a, b, a_on_b, b_on_a, _fabric) = pair(HarnessOpts::default());

        b.recv(Some(a_on_b), vec![vec![0u8; 8192]], 0xb0b, 0).unwrap();
        a.send(b_on_a, vec![pattern(4096)], 0xa11, 0, 0).unwrap();
        drain_one(&a, &b, 4);

        let tx_comps = a.read_cq(8);
        assert_eq!(tx_comps.len(), 1);
        assert_eq!(tx_comps[0].context, 0xa11);
        assert_eq!(tx_comps[0].len, 4096);
        assert_eq!(tx_comps[0].flags & flags::SEND, flags::SEND);

        let rx_comps = b.read_cq(8);
        assert_eq!(rx_comps.len(), 1);
        assert_eq!(rx_comps[0].context, 0xb0b);
        assert_eq!(rx_comps[0].len, 4096);
        assert_eq!(&rx_comps[0].buf.as_ref().unwrap()[0][..4096], &pattern(4096)[..]);

        // Everything in flight has drained.
        a.with_core(|core| {
            let peer = core.peer_mut(b_on_a);
            assert_eq!(peer.outstanding(crate::transport::TransportKind::Nic), 0);
            assert!(peer.outstanding_pkts.is_empty());
            assert_eq!(core.tx_entries.in_use(), 0);
        });
    }

    #[test]
    fn test_zero_length_send_completes_with_no_buf() {
        let (a, b, a_on_b, b_on_a, _fabric) = pair(HarnessOpts::default());

        b.recv(Some(a_on_b), vec![vec![0u8; 64]], 2, 0).unwrap();
        a.send(b_on_a, Vec::new(), 1, 0, 0).unwrap();
        drain_one(&a, &b, 4);

        let tx_comps = a.read_cq(8);
        assert_eq!(tx_comps[0].len, 0);
        assert!(tx_comps[0].buf.is_none());

        let rx_comps = b.read_cq(8);
        assert_eq!(rx_comps[0].len, 0);
        assert!(rx_comps[0].buf.is_none());
    }

    #[test]
    fn test_unknown_address_fails_synchronously() {
        let (a, _b, _a_on_b, _b_on_a, _fabric) = pair(HarnessOpts::default());

        let result = a.send(RemoteAddr(42), vec![vec![1u8; 16]], 1, 0, 0);
        assert_eq!(result.unwrap_err(), XferError::Fault(FaultKind::UnknownAddr));
        assert!(a.read_cq(8).is_empty());
    }

    #[test]
    fn test_long_send_windowed_by_cts() {
        let mut cfg = EndpointConfig::default();
        cfg.available_rx_bufs = 8;
        cfg.read_threshold = usize::max_value();

        let (a, b, a_on_b, b_on_a, _fabric) = pair(HarnessOpts {
            cfg,
            ..HarnessOpts::default()
        });

        let total = 1 << 20;
        b.recv(Some(a_on_b), vec![vec![0u8; total]], 7, 0).unwrap();
        a.send(b_on_a, vec![pattern(total)], 9, 0, 0).unwrap();

        // Request reaches the receiver, the receiver grants 8 packets.
        a.progress();
        b.progress();
        // The sender fills exactly the granted window.
        a.progress();

        a.with_core(|core| {
            let entry = core
                .tx_entries
                .get(0)
                .expect("long transfer still in flight");
            assert_eq!(entry.bytes_sent, 64 * 1024);
            assert_eq!(entry.window, 0);
        });

        // No window extension has arrived, so nothing further is posted.
        a.progress();
        a.with_core(|core| {
            assert_eq!(core.tx_entries.get(0).unwrap().bytes_sent, 64 * 1024);
        });

        for _ in 0..400 {
            a.progress();
            b.progress();
            if a.with_core(|core| core.tx_entries.in_use()) == 0 {
                break;
            }
        }

        let tx_comps = a.read_cq(8);
        assert_eq!(tx_comps.len(), 1);
        assert_eq!(tx_comps[0].len, total);

        let rx_comps = b.read_cq(8);
        assert_eq!(rx_comps.len(), 1);
        assert_eq!(rx_comps[0].len, total);
        assert_eq!(rx_comps[0].buf.as_ref().unwrap()[0], pattern(total));
    }

    #[test]
    fn test_rnr_backoff_then_replay() {
        let (a, b, _a_on_b, b_on_a, fabric) = pair(HarnessOpts::default());

        b.recv(None, vec![vec![0u8; 1024]], 5, 0).unwrap();

        // The receiver refuses the next frame.
        fabric.nic.force_rnr(fabric.b_name.source(), 1);

        let t0 = std::time::Instant::now();
        a.send(b_on_a, vec![pattern(512)], 6, 0, 0).unwrap();

        // The bounce lands the entry on the replay list and arms backoff.
        a.progress_at(t0);
        a.with_core(|core| {
            let peer = core.peer_mut(b_on_a);
            assert_eq!(peer.tx_rnr.len(), 1);
            assert!(peer.in_backoff(t0));
        });

        // Inside the quiet period nothing is replayed.
        a.progress_at(t0);
        a.with_core(|core| {
            assert_eq!(core.peer_mut(b_on_a).tx_rnr.len(), 1);
        });

        // Past the deadline the packet replays exactly once and completes
        // cleanly.
        a.progress_at(t0 + Duration::from_millis(5));
        b.progress();
        a.progress_at(t0 + Duration::from_millis(5));

        let tx_comps = a.read_cq(8);
        assert_eq!(tx_comps.len(), 1);
        assert_eq!(tx_comps[0].context, 6);
        assert!(a.read_cq_err(8).is_empty());

        let rx_comps = b.read_cq(8);
        assert_eq!(rx_comps.len(), 1);
        assert_eq!(rx_comps[0].len, 512);
    }

    #[test]
    fn test_eagain_requeues_and_retries() {
        let (a, b, _a_on_b, b_on_a, fabric) = pair(HarnessOpts::default());

        b.recv(None, vec![vec![0u8; 1024]], 1, 0).unwrap();
        fabric.nic.force_eagain(fabric.a_name.source(), 2);

        a.send(b_on_a, vec![pattern(100)], 2, 0, 0).unwrap();
        drain_one(&a, &b, 6);

        assert_eq!(a.read_cq(8).len(), 1);
        assert!(a.read_cq_err(8).is_empty());
        assert_eq!(b.read_cq(8).len(), 1);
    }

    #[test]
    fn test_tagged_unexpected_then_post() {
        let (a, b, a_on_b, b_on_a, _fabric) = pair(HarnessOpts::default());

        a.tsend(b_on_a, vec![pattern(300)], 0xfeed, 31, 0, 0).unwrap();
        drain_one(&a, &b, 4);

        b.with_core(|core| assert_eq!(core.unexp_tlist.len(), 1));

        // Mismatched tag stays unmatched.
        b.trecv(Some(a_on_b), vec![vec![0u8; 512]], 0xbeef, 0, 32, 0).unwrap();
        drain_one(&a, &b, 2);
        assert!(b.read_cq(8).is_empty());

        // A matching tag (under the ignore mask) consumes it.
        b.trecv(Some(a_on_b), vec![vec![0u8; 512]], 0xfe00, 0xff, 33, 0).unwrap();
        drain_one(&a, &b, 2);

        let comps = b.read_cq(8);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].context, 33);
        assert_eq!(comps[0].tag, 0xfeed);
        assert_eq!(comps[0].len, 300);
    }

    #[test]
    fn test_cancel_before_any_data() {
        let (a, b, a_on_b, _b_on_a, _fabric) = pair(HarnessOpts::default());

        b.recv(Some(a_on_b), vec![vec![0u8; 256]], 0xc0de, 0).unwrap();
        assert!(b.cancel(0xc0de));

        let errs = b.read_cq_err(8);
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].context, 0xc0de);
        assert_eq!(errs[0].kind, CompErrKind::Canceled);

        // Nothing matches the cancelled receive afterwards, and a second
        // cancel finds nothing.
        drain_one(&a, &b, 2);
        assert!(b.read_cq(8).is_empty());
        assert!(!b.cancel(0xc0de));
    }

    #[test]
    fn test_rma_write_lands_in_target() {
        let (a, b, _a_on_b, b_on_a, fabric) = pair(HarnessOpts::default());

        let mut view = fabric.registrar();
        let key = view.expose(&vec![0u8; 4096]);

        a.write(b_on_a, vec![pattern(4096)], key, 0, 77, flags::REMOTE_CQ_DATA, 0xdada)
            .unwrap();
        drain_one(&a, &b, 4);

        let tx_comps = a.read_cq(8);
        assert_eq!(tx_comps.len(), 1);
        assert_eq!(tx_comps[0].context, 77);
        assert_eq!(tx_comps[0].len, 4096);

        assert_eq!(view.snapshot(key).unwrap(), pattern(4096));

        // The immediate datum surfaces on the target side.
        let rx_comps = b.read_cq(8);
        assert_eq!(rx_comps.len(), 1);
        assert_eq!(rx_comps[0].data, 0xdada);
        assert_ne!(rx_comps[0].flags & flags::REMOTE_CQ_DATA, 0);
    }

    #[test]
    fn test_fragmented_write() {
        let (a, b, _a_on_b, b_on_a, fabric) = pair(HarnessOpts::default());

        let mut view = fabric.registrar();
        let total = 64 * 1024;
        let key = view.expose(&vec![0u8; total]);

        a.write(b_on_a, vec![pattern(total)], key, 0, 78, 0, 0).unwrap();
        for _ in 0..40 {
            a.progress();
            b.progress();
            if a.with_core(|core| core.tx_entries.in_use()) == 0 {
                break;
            }
        }

        let tx_comps = a.read_cq(8);
        assert_eq!(tx_comps.len(), 1);
        assert_eq!(view.snapshot(key).unwrap(), pattern(total));
    }

    #[test]
    fn test_rma_read_returns_remote_bytes() {
        let (a, b, _a_on_b, b_on_a, fabric) = pair(HarnessOpts::default());
        let _ = &b;

        let mut view = fabric.registrar();
        let key = view.expose(&pattern(2048));

        a.read(b_on_a, 2048, key, 0, 55).unwrap();
        drain_one(&a, &b, 4);

        let comps = a.read_cq(8);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].context, 55);
        assert_eq!(comps[0].len, 2048);
        assert_eq!(comps[0].buf.as_ref().unwrap()[0], pattern(2048));
    }

    #[test]
    fn test_atomics_apply_and_fetch() {
        let (a, b, _a_on_b, b_on_a, fabric) = pair(HarnessOpts::default());

        let mut view = fabric.registrar();
        let key = view.expose(&10u64.to_le_bytes());

        a.atomic(b_on_a, key, 0, AtomicKind::Add, 5, 1).unwrap();
        drain_one(&a, &b, 4);
        assert_eq!(a.read_cq(8).len(), 1);
        assert_eq!(
            u64::from_le_bytes(view.snapshot(key).unwrap().try_into().unwrap()),
            15
        );

        // Fetching add returns the prior value.
        a.atomic_fetch(b_on_a, key, 0, AtomicKind::Add, 5, 2).unwrap();
        drain_one(&a, &b, 4);
        let comps = a.read_cq(8);
        assert_eq!(comps.len(), 1);
        let buf = comps[0].buf.as_ref().unwrap();
        assert_eq!(u64::from_be_bytes(buf[0][..8].try_into().unwrap()), 15);

        // Compare-and-swap only fires on a match.
        a.atomic_compare(b_on_a, key, 0, 99, 20, 3).unwrap();
        drain_one(&a, &b, 4);
        let comps = a.read_cq(8);
        assert_eq!(u64::from_be_bytes(comps[0].buf.as_ref().unwrap()[0][..8].try_into().unwrap()), 20);
        assert_eq!(
            u64::from_le_bytes(view.snapshot(key).unwrap().try_into().unwrap()),
            99
        );
    }

    #[test]
    fn test_delivery_complete_waits_for_receipt() {
        let (a, b, a_on_b, b_on_a, _fabric) = pair(HarnessOpts::default());

        b.recv(Some(a_on_b), vec![vec![0u8; 128]], 1, 0).unwrap();
        a.send(b_on_a, vec![pattern(128)], 2, flags::DELIVERY_COMPLETE, 0).unwrap();

        // The send completion alone is not enough.
        a.progress();
        assert!(a.read_cq(8).is_empty());

        drain_one(&a, &b, 4);
        let comps = a.read_cq(8);
        assert_eq!(comps.len(), 1);
        assert_ne!(comps[0].flags & flags::DELIVERY_COMPLETE, 0);
    }

    #[test]
    fn test_long_read_rendezvous() {
        let mut cfg = EndpointConfig::default();
        cfg.read_threshold = 16 * 1024;

        let (a, b, a_on_b, b_on_a, _fabric) = pair(HarnessOpts {
            cfg,
            supports_read: true,
            ..HarnessOpts::default()
        });

        let total = 64 * 1024;

        // Feature exchange first, so the sender knows reads are usable.
        b.recv(Some(a_on_b), vec![vec![0u8; 10]], 2, 0).unwrap();
        a.send(b_on_a, vec![pattern(10)], 1, 0, 0).unwrap();
        drain_one(&a, &b, 4);
        a.read_cq(8);
        b.read_cq(8);

        b.recv(Some(a_on_b), vec![vec![0u8; total]], 4, 0).unwrap();
        a.send(b_on_a, vec![pattern(total)], 3, 0, 0).unwrap();

        // The released slot of the first send is reused for the rendezvous
        // entry.
        a.with_core(|core| {
            assert_eq!(
                core.tx_entries.get(0).map(|entry| entry.proto),
                Some(crate::entry::Proto::LongRead)
            );
        });

        drain_one(&a, &b, 8);

        let tx_comps = a.read_cq(8);
        assert_eq!(tx_comps.len(), 1);
        assert_eq!(tx_comps[0].context, 3);

        let rx_comps = b.read_cq(8);
        assert_eq!(rx_comps.len(), 1);
        assert_eq!(rx_comps[0].len, total);
        assert_eq!(rx_comps[0].buf.as_ref().unwrap()[0], pattern(total));
    }

    #[test]
    fn test_multi_recv_carves_consumers() {
        let mut cfg = EndpointConfig::default();
        cfg.min_multi_recv = 512;

        let (a, b, _a_on_b, b_on_a, _fabric) = pair(HarnessOpts {
            cfg,
            ..HarnessOpts::default()
        });

        b.recv(None, vec![vec![0u8; 1024]], 0x88, flags::MULTI_RECV).unwrap();

        a.send(b_on_a, vec![pattern(400)], 1, 0, 0).unwrap();
        drain_one(&a, &b, 4);

        let comps = b.read_cq(8);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].context, 0x88);
        assert_eq!(comps[0].len, 400);
        assert_eq!(comps[0].flags & flags::MULTI_RECV, 0);

        // The second message drops remaining capacity under the threshold and
        // retires the buffer.
        a.send(b_on_a, vec![pattern(200)], 2, 0, 0).unwrap();
        drain_one(&a, &b, 4);

        let comps = b.read_cq(8);
        assert_eq!(comps.len(), 2);
        assert_eq!(comps[0].len, 200);
        assert_ne!(comps[1].flags & flags::MULTI_RECV, 0);
        assert_eq!(comps[1].len, 600);
    }

    #[test]
    fn test_shm_lane_carries_node_local_traffic() {
        let (a, b, a_on_b, b_on_a, _fabric) = pair(HarnessOpts {
            shm: true,
            ..HarnessOpts::default()
        });

        b.recv(Some(a_on_b), vec![vec![0u8; 256]], 1, 0).unwrap();
        a.send(b_on_a, vec![pattern(256)], 2, 0, 0).unwrap();
        drain_one(&a, &b, 4);

        assert_eq!(a.read_cq(8).len(), 1);
        let comps = b.read_cq(8);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].buf.as_ref().unwrap()[0], pattern(256));

        a.with_core(|core| {
            assert!(core.shm.is_some());
            let peer = core.peer_mut(b_on_a);
            assert!(peer.node_local);
            assert_eq!(peer.outstanding(TransportKind::Shm), 0);
        });
    }

    #[test]
    fn test_peer_isolation_surfaces_event() {
        let (a, _b, _a_on_b, b_on_a, _fabric) = pair(HarnessOpts::default());

        a.with_core(|core| core.fail_peer(b_on_a, FaultKind::ProtocolMismatch));

        let events = a.read_eq();
        assert_eq!(events.len(), 1);
        match events[0] {
            Event::PeerFailed { addr, fault, at } => {
                assert_eq!(addr, b_on_a);
                assert_eq!(fault, FaultKind::ProtocolMismatch);
                assert!(at > 0);
            }
        }

        // A failed peer refuses further work.
        let result = a.send(b_on_a, vec![vec![1u8; 8]], 1, 0, 0);
        assert_eq!(result.unwrap_err(), XferError::Fault(FaultKind::PeerFailed));
    }

    #[test]
    fn test_close_reports_orphans_and_empties_pools() {
        let (a, _b, _a_on_b, b_on_a, _fabric) = pair(HarnessOpts::default());

        // Submit without draining completions: the entry is still in flight.
        a.send(b_on_a, vec![pattern(64)], 1, 0, 0).unwrap();

        let report = a.close();
        assert_eq!(report.tx_orphans, 1);

        a.with_core(|core| {
            assert_eq!(core.tx_entries.in_use(), 0);
            assert_eq!(core.rx_entries.in_use(), 0);
            assert_eq!(core.nic.tx_pkts.in_use(), 0);
            assert_eq!(core.nic.rx_pkts.in_use(), 0);
        });
    }

    #[test]
    fn test_zero_copy_recv_path() {
        let mut cfg = EndpointConfig::default();
        cfg.zero_copy_recv = true;

        let (a, b, _a_on_b, b_on_a, _fabric) = pair(HarnessOpts {
            cfg,
            ..HarnessOpts::default()
        });

        // First message bounces through the fallback (it carries the raw
        // name prefix); the buffer still fills and completes.
        b.recv(None, vec![vec![0u8; 1024]], 0x2c, 0).unwrap();
        a.send(b_on_a, vec![pattern(1024)], 0x2d, 0, 0).unwrap();
        drain_one(&a, &b, 6);

        let comps = b.read_cq(8);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].context, 0x2c);
        assert_eq!(comps[0].buf.as_ref().unwrap()[0], pattern(1024));
        assert_eq!(a.read_cq(8).len(), 1);
    }

    #[test]
    fn test_min_multi_recv_option_roundtrip() {
        let (a, _b, _a_on_b, _b_on_a, _fabric) = pair(HarnessOpts::default());

        let initial = a.min_multi_recv();
        a.set_min_multi_recv(initial * 2);
        assert_eq!(a.min_multi_recv(), initial * 2);
    }
}
