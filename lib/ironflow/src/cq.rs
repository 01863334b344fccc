//! Completion processing: drains the transport queues and advances the
//! owning transfer entries, one packet type at a time.

use crate::comp::{flags, Completion};
use crate::endpoint::EndpointCore;
use crate::entry::{iov_scatter, EntryRef, MultiState, RxEntry, RxId, RxState, TxId};
use crate::pool::PktId;
use crate::resolve::{EpName, RemoteAddr};
use crate::transport::{wr, CqEntry, CqErr, CqOp, TransportKind};
use crate::wire::{
    AtomicReq, Handshake, PktHeader, PktType, F_CQ_DATA, F_DELIVERY_COMPLETE, F_FETCH, F_REPLY,
    F_SRC_NAME, F_TAGGED, HDR_SIZE,
};
use byteorder::{BigEndian, ByteOrder};
use lodestone::logging;
use lodestone::shared::FaultKind;
use std::io::Cursor;
use std::time::Instant;

impl EndpointCore {
    /// Drains one transport's completion queue, bounded per tick, then its
    /// error queue.
    pub(crate) fn drain_cq(&mut self, kind: TransportKind, now: Instant) {
        let max = self.cfg.cq_read_size;

        let mut batch = Vec::new();
        self.lane_mut(kind).tr.drain_cq(&mut batch, max);
        for item in batch {
            match item.op {
                CqOp::Send => self.on_send_done(kind, item.wr_id),
                CqOp::Recv => self.on_recv_done(kind, item),
                CqOp::Read => self.on_read_done(kind, item),
            }
        }

        let mut errs = Vec::new();
        self.lane_mut(kind).tr.drain_err(&mut errs, max);
        for err in errs {
            self.on_cq_err(kind, err, now);
        }
    }

    // ---- send side -------------------------------------------------------

    fn on_send_done(&mut self, kind: TransportKind, wr_id: u64) {
        let pkt = match wr::unpack(wr_id) {
            wr::Target::Pkt(pkt) => pkt,
            target => panic!("send completion for non-packet target {:?}", target),
        };

        let meta = {
            let lane = self.lane_mut(kind);
            lane.outstanding -= 1;
            *lane.tx_pkts.meta(pkt)
        };

        if let Some(addr) = meta.peer {
            if let Some(peer) = self.av_mut().peer_mut(addr) {
                peer.drop_outstanding(kind);
                peer.outstanding_pkts.swap_remove(&pkt);
            }
        }

        self.lane_mut(kind).tx_pkts.release(pkt);

        match meta.entry {
            Some(EntryRef::Tx(tx)) => {
                let verdict = {
                    let entry = match self.tx_entries.get_mut(tx.0) {
                        Some(entry) => entry,
                        None => return,
                    };
                    entry.outstanding -= 1;
                    entry.bytes_acked += meta.acked_bytes;
                    let quiesced = entry.outstanding == 0 && entry.queued_pkts.is_empty();
                    (entry.failed, quiesced, entry.is_complete())
                };

                match verdict {
                    (true, true, _) => {
                        self.release_tx(tx);
                    }
                    (false, _, true) => self.deliver_tx(tx),
                    _ => {}
                }
            }
            Some(EntryRef::Rx(rx)) => {
                let verdict = {
                    let entry = match self.rx_entries.get_mut(rx.0) {
                        Some(entry) => entry,
                        None => return,
                    };
                    entry.outstanding -= 1;
                    let quiesced = entry.outstanding == 0 && entry.queued_pkts.is_empty();
                    (entry.failed, quiesced, entry.is_complete(), entry.parent)
                };

                match verdict {
                    (true, true, _, parent) => {
                        self.release_rx(rx);
                        if let Some(parent) = parent {
                            self.consumer_done(parent);
                        }
                    }
                    (false, _, true, _) => self.deliver_rx(rx),
                    _ => {}
                }
            }
            None => {}
        }
    }

    // ---- receive side ----------------------------------------------------

    fn on_recv_done(&mut self, kind: TransportKind, item: CqEntry) {
        match wr::unpack(item.wr_id) {
            wr::Target::Pkt(pkt) => {
                {
                    let lane = self.lane_mut(kind);
                    lane.posted_rx -= 1;
                    let frame = lane.rx_pkts.frame_mut(pkt);
                    let len = item.bytes.len().min(frame.len());
                    frame[..len].copy_from_slice(&item.bytes[..len]);
                    lane.rx_pkts.meta_mut(pkt).len = len;
                }

                let src = item.src.and_then(|source| {
                    self.av.as_ref().and_then(|av| av.of_source(source))
                });

                self.handle_pkt(kind, pkt, src);
            }
            wr::Target::UserRx(rx) => self.on_user_rx(kind, rx, item),
            target => panic!("receive completion for non-receive target {:?}", target),
        }
    }

    /// Entry point of the packet codec: parses the header and dispatches on
    /// the packet type. A source left unresolved is still processed; the
    /// REQ-class packets carry enough to attribute themselves.
    fn handle_pkt(&mut self, kind: TransportKind, pkt: PktId, src: Option<RemoteAddr>) {
        let header = {
            let lane = self.lane_mut(kind);
            let frame = lane.rx_pkts.filled(pkt);
            let mut cursor = Cursor::new(frame);
            match PktHeader::decode(&mut cursor) {
                Ok(header) => header,
                Err(err) => {
                    logging::warn!(self.log, "malformed packet dropped";
                                   "context" => "handle_pkt",
                                   "err" => ?err);
                    self.lane_mut(kind).rx_pkts.release(pkt);
                    return;
                }
            }
        };

        // First-contact packets carry the sender's raw name ahead of the
        // payload so an unknown source can be inserted on the spot.
        let mut src = src;
        let mut payload_at = HDR_SIZE;
        if header.has(F_SRC_NAME) {
            let parsed = {
                let lane = self.lane_mut(kind);
                let frame = lane.rx_pkts.filled(pkt);
                let mut cursor = Cursor::new(&frame[HDR_SIZE..]);
                EpName::decode(&mut cursor)
            };
            match parsed {
                Ok(name) => {
                    let addr = self.av_mut().insert(name, kind == TransportKind::Shm);
                    src = Some(addr);
                    payload_at += EpName::SIZE;
                }
                Err(_) => {
                    logging::warn!(self.log, "truncated name prefix, packet dropped";
                                   "context" => "handle_pkt");
                    self.lane_mut(kind).rx_pkts.release(pkt);
                    return;
                }
            }
        }

        match header.ptype {
            PktType::Handshake => self.on_handshake(kind, pkt, header, payload_at),
            PktType::Eager | PktType::LongReq | PktType::ReadRts => {
                self.on_req(kind, pkt, header, src, payload_at)
            }
            PktType::Cts => self.on_cts(kind, pkt, header),
            PktType::Data => self.on_data(kind, pkt, header, payload_at),
            PktType::Eor => self.on_eor(kind, pkt, header),
            PktType::Receipt => self.on_receipt(kind, pkt, header),
            PktType::Write => self.on_write(kind, pkt, header, src, payload_at),
            PktType::Atomic => self.on_atomic(kind, pkt, header, src, payload_at),
            PktType::AtomicResp => self.on_atomic_resp(kind, pkt, header, payload_at),
        }
    }

    fn on_handshake(&mut self, kind: TransportKind, pkt: PktId, header: PktHeader, payload_at: usize) {
        let parsed = {
            let lane = self.lane_mut(kind);
            let frame = lane.rx_pkts.filled(pkt);
            let mut cursor = Cursor::new(&frame[payload_at..]);
            Handshake::read(&mut cursor)
        };
        self.lane_mut(kind).rx_pkts.release(pkt);

        let handshake = match parsed {
            Ok(handshake) => handshake,
            Err(err) => {
                logging::warn!(self.log, "malformed handshake dropped";
                               "context" => "handshake", "err" => ?err);
                return;
            }
        };

        let addr = self
            .av_mut()
            .insert(handshake.name, kind == TransportKind::Shm);

        if handshake.protocol != lodestone::PROTOCOL_ID {
            self.fail_peer(addr, FaultKind::ProtocolMismatch);
            return;
        }
        if handshake.version != lodestone::VERSION_ID {
            self.fail_peer(addr, FaultKind::VersionMismatch);
            return;
        }

        let reply = header.has(F_REPLY);

        let peer = self.peer_mut(addr);
        peer.features = handshake.features;
        peer.tx_credits = handshake.credits;
        if !reply && !peer.handshake_sent {
            peer.handshake_queued = true;
            peer.handshake_reply = true;
        }

        logging::debug!(peer.log, "handshake received";
                        "context" => "handshake",
                        "reply" => reply,
                        "features" => handshake.features,
                        "credits" => handshake.credits);
    }

    /// REQ-class arrival: match a posted receive or create an unexpected
    /// entry that retains the packet.
    fn on_req(
        &mut self,
        kind: TransportKind,
        pkt: PktId,
        header: PktHeader,
        src: Option<RemoteAddr>,
        payload_at: usize,
    ) {
        let src = match src {
            Some(src) => src,
            None => {
                logging::warn!(self.log, "unattributable request dropped";
                               "context" => "on_req", "ptype" => ?header.ptype);
                self.lane_mut(kind).rx_pkts.release(pkt);
                return;
            }
        };

        let tagged = header.has(F_TAGGED);
        let tag = match tagged {
            true => header.aux,
            false => 0,
        };

        let matched = {
            let list = match tagged {
                true => &self.trecv_list,
                false => &self.recv_list,
            };
            list.iter().copied().find(|&rx| {
                self.rx_entries
                    .get(rx.0)
                    .map(|entry| entry.state == RxState::Init && entry.matches(src, tagged, tag))
                    .unwrap_or(false)
            })
        };

        match matched {
            Some(rx) => self.attach_req(kind, pkt, header, src, rx, payload_at),
            None => self.stash_unexpected(kind, pkt, header, src, tagged, tag),
        }
    }

    fn stash_unexpected(
        &mut self,
        kind: TransportKind,
        pkt: PktId,
        header: PktHeader,
        src: RemoteAddr,
        tagged: bool,
        tag: u64,
    ) {
        let comp = crate::entry::CompDesc {
            context: 0,
            flags: flags::RECV | if tagged { flags::TAGGED } else { flags::MSG },
            data: 0,
            len: 0,
            tag,
        };

        let mut entry = RxEntry::new(RxId(0), Some(src), Vec::new(), tagged, tag, 0, comp);
        entry.peer = Some(src);
        entry.transport = kind;
        entry.state = RxState::Unexp;
        entry.expected_len = header.total_len as usize;
        entry.remote_tx = header.tx_index;
        entry.unexp_pkt = Some(pkt);

        let index = match self.rx_entries.acquire(entry) {
            Some(index) => index,
            None => {
                logging::error!(self.log, "receive entry pool exhausted, unexpected message dropped";
                                "context" => "on_req",
                                "src" => src.0,
                                "total_len" => header.total_len);
                self.lane_mut(kind).rx_pkts.release(pkt);
                return;
            }
        };
        self.rx_entries.get_mut(index).expect("fresh entry").index = RxId(index);

        match tagged {
            true => self.unexp_tlist.push_back(RxId(index)),
            false => self.unexp_list.push_back(RxId(index)),
        }

        logging::trace!(self.log, "unexpected message stashed";
                        "context" => "on_req",
                        "entry" => index,
                        "src" => src.0,
                        "tagged" => tagged);
    }

    /// Lands a REQ on a posted entry, carving a consumer child first when the
    /// entry is a multi-receive parent.
    fn attach_req(
        &mut self,
        kind: TransportKind,
        pkt: PktId,
        header: PktHeader,
        src: RemoteAddr,
        rx: RxId,
        payload_at: usize,
    ) {
        let msg_len = header.total_len as usize;

        let is_parent = self
            .rx_entries
            .get(rx.0)
            .map(|entry| entry.multi.is_some())
            .unwrap_or(false);

        let target = match is_parent {
            false => rx,
            true => {
                let remaining = {
                    let parent = self.rx_entries.get(rx.0).expect("parent entry");
                    parent.multi.expect("parent").remaining
                };

                if remaining < msg_len {
                    // Parent has no room for this message; it flows to the
                    // unexpected path and the parent may now retire.
                    let tagged = header.has(F_TAGGED);
                    let tag = match tagged {
                        true => header.aux,
                        false => 0,
                    };
                    self.stash_unexpected(kind, pkt, header, src, tagged, tag);
                    self.retire_parent_if_spent(rx);
                    return;
                }

                let (context, parent_flags) = {
                    let parent = self.rx_entries.get(rx.0).expect("parent entry");
                    (parent.comp.context, parent.comp.flags & !flags::MULTI_RECV)
                };

                let comp = crate::entry::CompDesc {
                    context,
                    flags: parent_flags,
                    data: 0,
                    len: msg_len,
                    tag: 0,
                };
                let mut child = RxEntry::new(RxId(0), Some(src), vec![vec![0u8; msg_len]], false, 0, 0, comp);
                child.parent = Some(rx);

                let index = match self.rx_entries.acquire(child) {
                    Some(index) => index,
                    None => {
                        let tagged = header.has(F_TAGGED);
                        self.stash_unexpected(kind, pkt, header, src, tagged, 0);
                        return;
                    }
                };
                self.rx_entries.get_mut(index).expect("fresh entry").index = RxId(index);

                {
                    let parent = self.rx_entries.get_mut(rx.0).expect("parent entry");
                    let multi = parent.multi.as_mut().expect("parent");
                    multi.remaining -= msg_len;
                    multi.consumers += 1;
                }

                RxId(index)
            }
        };

        // Common match bookkeeping.
        {
            let entry = self.rx_entries.get_mut(target.0).expect("matched entry");
            entry.peer = Some(src);
            entry.transport = kind;
            entry.state = RxState::Matched;
            entry.expected_len = msg_len;
            entry.remote_tx = header.tx_index;
            if header.has(F_CQ_DATA) {
                entry.comp.data = header.data;
                entry.comp.flags |= flags::REMOTE_CQ_DATA;
            }
            if header.has(F_DELIVERY_COMPLETE) {
                entry.send_receipt = true;
            }
        }

        match header.ptype {
            PktType::Eager => self.attach_eager(kind, pkt, header, target, payload_at),
            PktType::LongReq => self.attach_long(kind, pkt, header, target),
            PktType::ReadRts => self.attach_read_rts(kind, pkt, target, payload_at),
            ptype => panic!("request attach for non-request type {:?}", ptype),
        }

        if is_parent {
            self.retire_parent_if_spent(rx);
        }
    }

    /// Parent retires once its remaining capacity dips under the threshold
    /// and no consumer is still running.
    fn retire_parent_if_spent(&mut self, parent: RxId) {
        let spent = {
            match self.rx_entries.get(parent.0) {
                Some(entry) => match entry.multi {
                    Some(MultiState {
                        remaining,
                        consumers,
                        cancelled,
                    }) => (remaining < self.min_multi_recv || cancelled) && consumers == 0,
                    None => false,
                },
                None => false,
            }
        };

        if spent {
            self.deliver_multi_final(parent);
        }
    }

    fn attach_eager(
        &mut self,
        kind: TransportKind,
        pkt: PktId,
        header: PktHeader,
        rx: RxId,
        payload_at: usize,
    ) {
        let payload_len = header.payload_len as usize - (payload_at - HDR_SIZE);

        let fits = {
            let entry = self.rx_entries.get(rx.0).expect("entry");
            payload_len <= crate::entry::iov_len(&entry.iov)
        };

        if !fits {
            self.lane_mut(kind).rx_pkts.release(pkt);
            self.fail_rx(rx, FaultKind::Truncated, 0);
            return;
        }

        {
            let lane = match kind {
                TransportKind::Nic => &mut self.nic,
                TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
            };
            let frame = lane.rx_pkts.filled(pkt);
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");
            iov_scatter(&mut entry.iov, 0, &frame[payload_at..payload_at + payload_len]);
            entry.bytes_received = payload_len;
            entry.state = RxState::Recv;
        }

        self.lane_mut(kind).rx_pkts.release(pkt);

        if self.rx_entries.get(rx.0).expect("entry").send_receipt {
            self.push_terminal_ctrl(rx, kind);
        }

        if self.rx_entries.get(rx.0).expect("entry").is_complete() {
            self.deliver_rx(rx);
        }
    }

    fn attach_long(&mut self, kind: TransportKind, pkt: PktId, header: PktHeader, rx: RxId) {
        self.lane_mut(kind).rx_pkts.release(pkt);

        let fits = {
            let entry = self.rx_entries.get(rx.0).expect("entry");
            entry.expected_len <= crate::entry::iov_len(&entry.iov)
        };
        if !fits {
            self.fail_rx(rx, FaultKind::Truncated, 0);
            return;
        }

        {
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");
            entry.state = RxState::Recv;
        }

        // The requested credit count rides in the offset field.
        let requested = header.offset as u32;
        self.grant_window(rx, kind, requested);
    }

    /// Grants (or extends) the receive window from the buffer quota and sends
    /// the CTS.
    pub(crate) fn grant_window(&mut self, rx: RxId, kind: TransportKind, requested: u32) {
        let max_payload = self.cfg.max_data_payload;
        let available = self.available_rx_bufs.max(1) as u32;

        let (granted, grant_bytes, remote_tx) = {
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");

            let remaining = entry.expected_len - entry.bytes_received - entry.window_open;
            if remaining == 0 {
                return;
            }

            let need = ((remaining + max_payload - 1) / max_payload) as u32;
            // At least one packet is always granted so the sender cannot
            // stall forever on an empty quota.
            let granted = requested.min(need).min(available).max(1);
            let grant_bytes = (granted as usize * max_payload).min(remaining);

            entry.window_open += grant_bytes;
            entry.window_grant = grant_bytes;
            (granted, grant_bytes, entry.remote_tx)
        };

        self.available_rx_bufs = self.available_rx_bufs.saturating_sub(granted as usize);

        let peer = self.rx_entries.get(rx.0).expect("entry").peer.expect("matched");

        let mut cts = PktHeader::new(PktType::Cts);
        cts.tx_index = remote_tx;
        cts.rx_index = rx.0;
        cts.aux = grant_bytes as u64;

        match self.build_ctrl_pkt(kind, cts, &[], Some(EntryRef::Rx(rx)), peer) {
            Some(ctrl) => self.send_rx_ctrl(rx, kind, ctrl),
            None => {
                // No packet buffer for the CTS right now; roll the grant back
                // and park the entry so the control retry pass re-issues it.
                let entry = self.rx_entries.get_mut(rx.0).expect("entry");
                entry.window_open -= grant_bytes;
                self.available_rx_bufs += granted as usize;
                self.queue_rx_ctrl_rebuild(rx);
            }
        }
    }

    /// Parks a receive entry whose control packet could not even be built.
    fn queue_rx_ctrl_rebuild(&mut self, rx: RxId) {
        let peer_addr = {
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");
            entry.state = RxState::QueuedCtrl;
            entry.peer.expect("matched receive has a peer")
        };

        let peer = self.peer_mut(peer_addr);
        if !peer.rx_ctrl.contains(&rx) {
            peer.rx_ctrl.push_back(rx);
        }
    }

    fn attach_read_rts(&mut self, kind: TransportKind, pkt: PktId, rx: RxId, payload_at: usize) {
        let table = {
            let lane = self.lane_mut(kind);
            let frame = lane.rx_pkts.filled(pkt);
            let mut cursor = Cursor::new(&frame[payload_at..]);
            crate::wire::read_read_table(&mut cursor)
        };
        self.lane_mut(kind).rx_pkts.release(pkt);

        let segs = match table {
            Ok(segs) => segs,
            Err(_) => {
                self.fail_rx(rx, FaultKind::Truncated, 0);
                return;
            }
        };

        let fits = {
            let entry = self.rx_entries.get(rx.0).expect("entry");
            entry.expected_len <= crate::entry::iov_len(&entry.iov)
        };
        if !fits {
            self.fail_rx(rx, FaultKind::Truncated, 0);
            return;
        }

        {
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");
            entry.state = RxState::Recv;
            entry.read_segs = segs;
            // The sender holds its segments until the end-of-read notice.
            entry.send_receipt = true;
        }

        self.read_pending.push_back(EntryRef::Rx(rx));
    }

    fn on_cts(&mut self, kind: TransportKind, pkt: PktId, header: PktHeader) {
        self.lane_mut(kind).rx_pkts.release(pkt);

        let tx = TxId(header.tx_index);
        let alive = {
            match self.tx_entries.get_mut(tx.0) {
                Some(entry) => {
                    entry.remote_rx = header.rx_index;
                    // The open window never exceeds what is left to send.
                    let grant = (header.aux as usize).min(entry.unsent().saturating_sub(entry.window));
                    entry.window += grant;
                    true
                }
                None => false,
            }
        };

        if alive && !self.tx_pending.contains(&tx) {
            self.tx_pending.push_back(tx);
        }
    }

    fn on_data(&mut self, kind: TransportKind, pkt: PktId, header: PktHeader, payload_at: usize) {
        let payload_len = header.payload_len as usize;
        let rx = RxId(header.rx_index);

        // The consumed buffer returns to the grant quota either way.
        self.available_rx_bufs += 1;

        let alive = self.rx_entries.get(rx.0).is_some();
        if !alive {
            // Receiver vanished (cancelled before any data); drop quietly.
            self.lane_mut(kind).rx_pkts.release(pkt);
            return;
        }

        let suppressed = self.rx_entries.get(rx.0).expect("entry").cancel_suppressed;

        {
            let lane = match kind {
                TransportKind::Nic => &mut self.nic,
                TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
            };
            let frame = lane.rx_pkts.filled(pkt);
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");

            if !suppressed {
                iov_scatter(
                    &mut entry.iov,
                    header.offset as usize,
                    &frame[payload_at..payload_at + payload_len],
                );
            }
            entry.bytes_received += payload_len;
            entry.window_open = entry.window_open.saturating_sub(payload_len);
        }

        self.lane_mut(kind).rx_pkts.release(pkt);

        let (done, refill) = {
            let entry = self.rx_entries.get(rx.0).expect("entry");
            let done = entry.bytes_received >= entry.expected_len;
            let refill = !done && !suppressed && entry.window_open <= entry.window_grant / 2;
            (done, refill)
        };

        if refill {
            self.grant_window(rx, kind, u32::max_value());
        }

        if done {
            if !suppressed && self.rx_entries.get(rx.0).expect("entry").send_receipt {
                self.push_terminal_ctrl(rx, kind);
            }
            if self.rx_entries.get(rx.0).expect("entry").is_complete() {
                self.deliver_rx(rx);
            }
        }
    }

    /// Terminal control packet owed to the sender: the end-of-read notice for
    /// rendezvous receives, the receipt otherwise. Owned by the receive entry
    /// so completion ordering holds: the entry retires only after the packet
    /// is on the wire.
    pub(crate) fn push_terminal_ctrl(&mut self, rx: RxId, kind: TransportKind) {
        let (peer, remote_tx, eor) = {
            let entry = self.rx_entries.get(rx.0).expect("entry");
            (
                entry.peer.expect("matched"),
                entry.remote_tx,
                !entry.read_segs.is_empty(),
            )
        };

        let mut header = PktHeader::new(match eor {
            true => PktType::Eor,
            false => PktType::Receipt,
        });
        header.tx_index = remote_tx;
        header.rx_index = rx.0;

        match self.build_ctrl_pkt(kind, header, &[], Some(EntryRef::Rx(rx)), peer) {
            Some(pkt) => {
                self.rx_entries.get_mut(rx.0).expect("entry").send_receipt = false;
                self.send_rx_ctrl(rx, kind, pkt);
            }
            None => self.queue_rx_ctrl_rebuild(rx),
        }
    }

    fn on_eor(&mut self, kind: TransportKind, pkt: PktId, header: PktHeader) {
        self.lane_mut(kind).rx_pkts.release(pkt);

        let tx = TxId(header.tx_index);
        let done = {
            match self.tx_entries.get_mut(tx.0) {
                Some(entry) => {
                    entry.bytes_sent = entry.total_len;
                    entry.bytes_acked = entry.total_len;
                    // The end-of-read notice subsumes the delivery receipt.
                    entry.receipt_seen = true;
                    entry.is_complete() && !entry.failed
                }
                None => false,
            }
        };

        if done {
            self.deliver_tx(tx);
        }
    }

    fn on_receipt(&mut self, kind: TransportKind, pkt: PktId, header: PktHeader) {
        self.lane_mut(kind).rx_pkts.release(pkt);

        let tx = TxId(header.tx_index);
        let done = {
            match self.tx_entries.get_mut(tx.0) {
                Some(entry) => {
                    entry.receipt_seen = true;
                    entry.bytes_acked = entry.bytes_acked.max(entry.bytes_sent);
                    entry.is_complete() && !entry.failed
                }
                None => false,
            }
        };

        if done {
            self.deliver_tx(tx);
        }
    }

    fn on_write(
        &mut self,
        kind: TransportKind,
        pkt: PktId,
        header: PktHeader,
        src: Option<RemoteAddr>,
        payload_at: usize,
    ) {
        let payload_len = header.payload_len as usize - (payload_at - HDR_SIZE);

        let applied = {
            let lane = match kind {
                TransportKind::Nic => &mut self.nic,
                TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
            };
            let frame = lane.rx_pkts.filled(pkt);
            self.registrar.write_target(
                header.aux,
                header.offset,
                &frame[payload_at..payload_at + payload_len],
            )
        };
        self.lane_mut(kind).rx_pkts.release(pkt);

        if let Err(err) = applied {
            logging::warn!(self.log, "one-sided write rejected";
                           "context" => "on_write",
                           "key" => header.aux,
                           "err" => ?err);
            return;
        }

        if header.has(F_CQ_DATA) {
            self.cq.push(Completion {
                context: 0,
                flags: flags::RMA | flags::WRITE | flags::REMOTE_CQ_DATA,
                len: header.total_len as usize,
                data: header.data,
                tag: 0,
                buf: None,
            });
            self.rx_cntr.add();
        }

        if header.has(F_DELIVERY_COMPLETE) {
            match src {
                Some(src) => self.push_loose_receipt(kind, src, header.tx_index),
                None => {
                    logging::warn!(self.log, "receipt requested by unattributable write";
                                   "context" => "on_write");
                }
            }
        }
    }

    fn push_loose_receipt(&mut self, kind: TransportKind, peer: RemoteAddr, remote_tx: u32) {
        let mut header = PktHeader::new(PktType::Receipt);
        header.tx_index = remote_tx;

        match self.build_ctrl_pkt(kind, header, &[], None, peer) {
            Some(pkt) => self.send_loose_ctrl(kind, pkt),
            None => {
                logging::error!(self.log, "packet pool exhausted, receipt dropped";
                                "context" => "push_receipt");
            }
        }
    }

    fn on_atomic(
        &mut self,
        kind: TransportKind,
        pkt: PktId,
        header: PktHeader,
        src: Option<RemoteAddr>,
        payload_at: usize,
    ) {
        let parsed = {
            let lane = self.lane_mut(kind);
            let frame = lane.rx_pkts.filled(pkt);
            let mut cursor = Cursor::new(&frame[payload_at..]);
            AtomicReq::read(&mut cursor)
        };
        self.lane_mut(kind).rx_pkts.release(pkt);

        let req = match parsed {
            Ok(req) => req,
            Err(err) => {
                logging::warn!(self.log, "malformed atomic dropped";
                               "context" => "on_atomic", "err" => ?err);
                return;
            }
        };

        let prior = self.registrar.atomic_target(
            header.aux,
            header.offset,
            req.kind,
            req.operand,
            req.compare,
        );

        let prior = match prior {
            Ok(prior) => prior,
            Err(err) => {
                logging::warn!(self.log, "atomic rejected";
                               "context" => "on_atomic",
                               "key" => header.aux,
                               "err" => ?err);
                return;
            }
        };

        if header.has(F_FETCH) {
            let src = match src {
                Some(src) => src,
                None => {
                    logging::warn!(self.log, "fetch atomic from unattributable source";
                                   "context" => "on_atomic");
                    return;
                }
            };

            let mut resp = PktHeader::new(PktType::AtomicResp);
            resp.tx_index = header.tx_index;

            let mut payload = [0u8; 8];
            BigEndian::write_u64(&mut payload, prior);

            match self.build_ctrl_pkt(kind, resp, &payload, None, src) {
                Some(pkt) => self.send_loose_ctrl(kind, pkt),
                None => {
                    logging::error!(self.log, "packet pool exhausted, atomic response dropped";
                                    "context" => "on_atomic");
                }
            }
        }
    }

    fn on_atomic_resp(&mut self, kind: TransportKind, pkt: PktId, header: PktHeader, payload_at: usize) {
        let prior = {
            let lane = self.lane_mut(kind);
            let frame = lane.rx_pkts.filled(pkt);
            match frame.len() >= payload_at + 8 {
                true => Some(BigEndian::read_u64(&frame[payload_at..])),
                false => None,
            }
        };
        self.lane_mut(kind).rx_pkts.release(pkt);

        let prior = match prior {
            Some(prior) => prior,
            None => {
                logging::warn!(self.log, "truncated atomic response dropped"; "context" => "on_atomic_resp");
                return;
            }
        };

        let tx = TxId(header.tx_index);
        let done = {
            match self.tx_entries.get_mut(tx.0) {
                Some(entry) => {
                    iov_scatter(&mut entry.iov, 0, &prior.to_be_bytes());
                    entry.bytes_sent = entry.total_len;
                    entry.bytes_acked = entry.total_len;
                    entry.is_complete() && !entry.failed
                }
                None => false,
            }
        };

        if done {
            self.deliver_tx(tx);
        }
    }

    /// Zero-copy receive completion: the eager payload is already in the
    /// user buffer; anything else bounces through a provider buffer.
    fn on_user_rx(&mut self, kind: TransportKind, rx: RxId, item: CqEntry) {
        // A cancelled entry only waits out its posted buffer.
        let cancelled = {
            let entry = match self.rx_entries.get_mut(rx.0) {
                Some(entry) => entry,
                None => return,
            };
            entry.outstanding -= 1;

            match entry.failed || entry.cancel_suppressed {
                true => Some(entry.outstanding == 0 && entry.queued_pkts.is_empty()),
                false => None,
            }
        };
        if let Some(quiesced) = cancelled {
            if quiesced {
                self.release_rx(rx);
            }
            return;
        }

        let mut cursor = Cursor::new(&item.bytes[..]);
        let header = match PktHeader::decode(&mut cursor) {
            Ok(header) => header,
            Err(_) => {
                logging::warn!(self.log, "malformed zero-copy frame dropped"; "context" => "on_user_rx");
                return;
            }
        };

        if header.ptype == PktType::Eager && !header.has(F_SRC_NAME) {
            let payload_len = header.payload_len as usize;
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");
            iov_scatter(&mut entry.iov, 0, &item.bytes[HDR_SIZE..HDR_SIZE + payload_len]);
            entry.bytes_received = payload_len;
            entry.expected_len = payload_len;
            entry.state = RxState::Recv;
            if header.has(F_CQ_DATA) {
                entry.comp.data = header.data;
                entry.comp.flags |= flags::REMOTE_CQ_DATA;
            }

            if self.rx_entries.get(rx.0).expect("entry").is_complete() {
                self.deliver_rx(rx);
            }
            return;
        }

        // Fallback: land the frame in a provider buffer and take the normal
        // path.
        match self.lane_mut(kind).rx_pkts.acquire() {
            Some(pkt) => {
                {
                    let lane = self.lane_mut(kind);
                    let frame = lane.rx_pkts.frame_mut(pkt);
                    let len = item.bytes.len().min(frame.len());
                    frame[..len].copy_from_slice(&item.bytes[..len]);
                    lane.rx_pkts.meta_mut(pkt).len = len;
                }
                let src = item.src.and_then(|source| {
                    self.av.as_ref().and_then(|av| av.of_source(source))
                });
                self.handle_pkt(kind, pkt, src);
            }
            None => {
                logging::error!(self.log, "provider pool exhausted, zero-copy fallback dropped";
                                "context" => "on_user_rx");
            }
        }

        // The consumed buffer re-arms if the entry is still waiting for its
        // own arrival (the frame above may have been it, via the fallback).
        let rearm = self
            .rx_entries
            .get(rx.0)
            .map(|entry| entry.state == RxState::Init && !entry.failed)
            .unwrap_or(false);
        if rearm {
            let _ = self.post_user_recv(rx);
        }
    }

    // ---- one-sided reads -------------------------------------------------

    fn on_read_done(&mut self, _kind: TransportKind, item: CqEntry) {
        match wr::unpack(item.wr_id) {
            wr::Target::ReadTx(tx) => {
                let done = {
                    match self.tx_entries.get_mut(tx.0) {
                        Some(entry) => {
                            entry.outstanding -= 1;
                            iov_scatter(&mut entry.iov, 0, &item.bytes);
                            entry.bytes_sent = entry.total_len;
                            entry.bytes_acked = entry.total_len;
                            entry.is_complete() && !entry.failed
                        }
                        None => return,
                    }
                };
                if done {
                    self.deliver_tx(tx);
                }
            }
            wr::Target::ReadRx(rx, seg) => {
                let (done, kind) = {
                    let entry = match self.rx_entries.get_mut(rx.0) {
                        Some(entry) => entry,
                        None => return,
                    };
                    entry.outstanding -= 1;

                    let offset: u64 = entry
                        .read_segs
                        .iter()
                        .take(seg as usize)
                        .map(|(_, len)| len)
                        .sum();
                    iov_scatter(&mut entry.iov, offset as usize, &item.bytes);
                    entry.bytes_received += item.bytes.len();

                    (entry.bytes_received >= entry.expected_len, entry.transport)
                };

                if done {
                    // Tell the sender its segments are consumed.
                    self.push_terminal_ctrl(rx, kind);

                    if self.rx_entries.get(rx.0).expect("entry").is_complete() {
                        self.deliver_rx(rx);
                    }
                }
            }
            target => panic!("read completion for non-read target {:?}", target),
        }
    }

    // ---- errors ----------------------------------------------------------

    fn on_cq_err(&mut self, kind: TransportKind, err: CqErr, now: Instant) {
        match wr::unpack(err.wr_id) {
            wr::Target::Pkt(pkt) => match err.op {
                CqOp::Send if err.rnr => self.on_rnr(kind, pkt, now),
                CqOp::Send => self.on_send_fault(kind, pkt, err.code),
                CqOp::Recv => {
                    let lane = self.lane_mut(kind);
                    lane.posted_rx -= 1;
                    lane.rx_pkts.release(pkt);
                    logging::warn!(self.log, "posted receive failed";
                                   "context" => "cq_err", "code" => err.code);
                }
                CqOp::Read => {
                    logging::warn!(self.log, "read completion for packet target";
                                   "context" => "cq_err", "code" => err.code);
                }
            },
            wr::Target::UserRx(rx) => {
                if let Some(entry) = self.rx_entries.get_mut(rx.0) {
                    entry.outstanding -= 1;
                }
                self.fail_rx(rx, FaultKind::Transport(err.code), err.code);
            }
            wr::Target::ReadTx(tx) => {
                if let Some(entry) = self.tx_entries.get_mut(tx.0) {
                    entry.outstanding -= 1;
                }
                self.fail_tx(tx, FaultKind::Transport(err.code), err.code);
            }
            wr::Target::ReadRx(rx, _) => {
                if let Some(entry) = self.rx_entries.get_mut(rx.0) {
                    entry.outstanding -= 1;
                }
                self.fail_rx(rx, FaultKind::Transport(err.code), err.code);
            }
        }
    }

    /// Receiver-not-ready: the packet is retained for replay, the entry
    /// parks on the peer's replay list and the peer enters backoff.
    fn on_rnr(&mut self, kind: TransportKind, pkt: PktId, now: Instant) {
        let meta = {
            let lane = self.lane_mut(kind);
            lane.outstanding -= 1;
            *lane.tx_pkts.meta(pkt)
        };

        let backoff_min = std::time::Duration::from_micros(self.cfg.backoff_min_us);
        let backoff_max = std::time::Duration::from_micros(self.cfg.backoff_max_us);

        if let Some(addr) = meta.peer {
            if let Some(peer) = self.av_mut().peer_mut(addr) {
                peer.drop_outstanding(kind);
                peer.outstanding_pkts.swap_remove(&pkt);
                peer.enter_backoff(now, backoff_min, backoff_max);
            }
        }

        match meta.entry {
            Some(EntryRef::Tx(tx)) => {
                if let Some(entry) = self.tx_entries.get_mut(tx.0) {
                    entry.outstanding -= 1;
                }
                self.queue_tx_pkt(tx, pkt, false);
            }
            Some(EntryRef::Rx(rx)) => {
                if let Some(entry) = self.rx_entries.get_mut(rx.0) {
                    entry.outstanding -= 1;
                }
                self.queue_rx_pkt(rx, pkt, false);
            }
            None => {
                self.ctrl_queue.push_back((kind, pkt));
            }
        }

        logging::debug!(self.log, "receiver not ready, packet parked for replay";
                        "context" => "rnr",
                        "pkt" => pkt.0);
    }

    fn on_send_fault(&mut self, kind: TransportKind, pkt: PktId, code: i32) {
        let meta = {
            let lane = self.lane_mut(kind);
            lane.outstanding -= 1;
            *lane.tx_pkts.meta(pkt)
        };

        if let Some(addr) = meta.peer {
            if let Some(peer) = self.av_mut().peer_mut(addr) {
                peer.drop_outstanding(kind);
                peer.outstanding_pkts.swap_remove(&pkt);
            }
        }

        self.lane_mut(kind).tx_pkts.release(pkt);

        match meta.entry {
            Some(EntryRef::Tx(tx)) => {
                if let Some(entry) = self.tx_entries.get_mut(tx.0) {
                    entry.outstanding -= 1;
                }
                self.fail_tx(tx, FaultKind::Transport(code), code);
            }
            Some(EntryRef::Rx(rx)) => {
                if let Some(entry) = self.rx_entries.get_mut(rx.0) {
                    entry.outstanding -= 1;
                }
                self.fail_rx(rx, FaultKind::Transport(code), code);
            }
            None => {
                logging::error!(self.log, "control packet failed terminally";
                                "context" => "cq_err", "code" => code);
            }
        }
    }

    // ---- unexpected matching --------------------------------------------

    /// Scans the unexpected list for a message satisfying a freshly posted
    /// receive and replays its retained packet through the normal path.
    pub(crate) fn match_unexpected(&mut self, rx: RxId) -> bool {
        let tagged = match self.rx_entries.get(rx.0) {
            Some(entry) => entry.tagged,
            None => return false,
        };

        let list = match tagged {
            true => &self.unexp_tlist,
            false => &self.unexp_list,
        };

        let found = list.iter().copied().find(|&unexp| {
            let posted = self.rx_entries.get(rx.0);
            let stashed = self.rx_entries.get(unexp.0);
            match (posted, stashed) {
                (Some(posted), Some(stashed)) => posted.matches(
                    stashed.src.expect("unexpected entries have a source"),
                    stashed.tagged,
                    stashed.tag,
                ),
                _ => false,
            }
        });

        let unexp = match found {
            Some(unexp) => unexp,
            None => return false,
        };

        let (pkt, kind, src) = {
            let entry = self.rx_entries.get_mut(unexp.0).expect("listed entry");
            (
                entry.unexp_pkt.take().expect("unexpected entry retains its packet"),
                entry.transport,
                entry.src.expect("unexpected entries have a source"),
            )
        };
        self.release_rx(unexp);

        logging::trace!(self.log, "unexpected message matched";
                        "context" => "match_unexp",
                        "posted" => rx.0,
                        "stashed" => unexp.0);

        self.handle_pkt(kind, pkt, Some(src));
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::entry::RxState;
    use crate::testkit::harness::{drain_one, pair, HarnessOpts};

    #[test]
    fn test_unexpected_then_post_merges() {
        let (a, b, a_addr_on_b, b_addr_on_a, _fabric) = pair(HarnessOpts::default());

        // A sends before B posts anything.
        a.send(b_addr_on_a, vec![vec![7u8; 256]], 0x11, 0, 0).unwrap();
        drain_one(&a, &b, 4);

        // The message sits in an unexpected entry on B.
        b.with_core(|core| {
            assert_eq!(core.unexp_list.len(), 1);
            let rx = core.unexp_list[0];
            assert_eq!(core.rx_entries.get(rx.0).unwrap().state, RxState::Unexp);
        });

        // Posting a matching receive consumes it.
        b.recv(Some(a_addr_on_b), vec![vec![0u8; 256]], 0x22, 0).unwrap();
        drain_one(&a, &b, 4);

        let comps = b.read_cq(8);
        assert_eq!(comps.len(), 1);
        assert_eq!(comps[0].context, 0x22);
        assert_eq!(comps[0].len, 256);
        assert_eq!(comps[0].buf.as_ref().unwrap()[0], vec![7u8; 256]);

        b.with_core(|core| assert!(core.unexp_list.is_empty()));
    }
}
