//! Posting layer: turns transfer entries into packets and hands them to the
//! right transport, batching with the more-to-come flag where the caller
//! allows it.

use crate::endpoint::EndpointCore;
use crate::entry::{iov_gather, EntryRef, Proto, RxId, RxState, TxId, TxOp, TxState};
use crate::mr::ACCESS_REMOTE;
use crate::pool::{PktId, PktMeta};
use crate::resolve::{EpName, RemoteAddr};
use crate::transport::{wr, TransportKind};
use crate::wire::{
    AtomicReq, Handshake, PktHeader, PktType, F_CQ_DATA, F_DELIVERY_COMPLETE, F_FETCH, F_REPLY,
    F_SRC_NAME, F_TAGGED, FEAT_READ,
};
use lodestone::logging;
use lodestone::shared::{FaultKind, XferError, XferResult};
use std::io::Cursor;

impl EndpointCore {
    /// Protocol selection and first posting step for a fresh transmit entry.
    pub(crate) fn start_tx(&mut self, tx: TxId) {
        let (op, total_len, dest, kind) = {
            let entry = self.tx_entries.get(tx.0).expect("submitted entry");
            (entry.op, entry.total_len, entry.dest, entry.transport)
        };

        match op {
            TxOp::Read => {
                self.read_pending.push_back(EntryRef::Tx(tx));
            }
            TxOp::Atomic | TxOp::FetchAtomic | TxOp::CompareAtomic => {
                self.tx_eager(tx);
            }
            TxOp::Write => {
                if total_len <= self.eager_limit(dest) {
                    self.tx_eager(tx);
                } else {
                    // One-sided writes have no receiver entry granting CTS
                    // windows; they pace on the outstanding-ops quota alone.
                    let entry = self.tx_entries.get_mut(tx.0).expect("submitted entry");
                    entry.proto = Proto::LongCts;
                    entry.window = total_len;
                    self.tx_pending.push_back(tx);
                }
            }
            TxOp::Msg | TxOp::Tagged => {
                let read_ok = {
                    let peer = self.peer_mut(dest);
                    peer.features & FEAT_READ != 0
                };

                if total_len <= self.eager_limit(dest) {
                    self.tx_eager(tx);
                } else if read_ok
                    && total_len >= self.cfg.read_threshold
                    && self.lane_mut(kind).tr.supports_read()
                {
                    self.tx_read_rts(tx);
                } else {
                    self.tx_long_init(tx);
                }
            }
        }
    }

    /// Largest transfer that still fits a single packet to this peer,
    /// accounting for the raw-name prefix carried before the handshake.
    fn eager_limit(&mut self, dest: RemoteAddr) -> usize {
        let prefix = match self.peer_mut(dest).handshake_sent {
            true => 0,
            false => EpName::SIZE,
        };
        self.cfg.max_data_payload - prefix.min(self.cfg.max_data_payload)
    }

    /// Single-packet path: eager messages, small writes and every atomic.
    pub(crate) fn tx_eager(&mut self, tx: TxId) {
        let kind = self.tx_entries.get(tx.0).expect("entry").transport;
        let local_name = self.name.expect("endpoint enabled");

        let pkt = match self.lane_mut(kind).tx_pkts.acquire() {
            Some(pkt) => pkt,
            None => {
                self.park_tx_ctrl(tx);
                return;
            }
        };

        // Build the frame.
        {
            let entry = self.tx_entries.get(tx.0).expect("entry");
            let dest = entry.dest;
            let handshake_sent = self
                .av
                .as_ref()
                .and_then(|av| av.peer(dest))
                .map(|peer| peer.handshake_sent)
                .unwrap_or(false);

            let mut header = PktHeader::new(match entry.op {
                TxOp::Msg | TxOp::Tagged => PktType::Eager,
                TxOp::Write => PktType::Write,
                _ => PktType::Atomic,
            });
            header.tx_index = tx.0;
            header.total_len = entry.total_len as u64;

            if entry.op == TxOp::Tagged {
                header.flags |= F_TAGGED;
                header.aux = entry.comp.tag;
            }
            if let Some(rma) = entry.rma {
                header.aux = rma.key;
                header.offset = rma.offset;
            }
            if entry.comp.flags & crate::comp::flags::REMOTE_CQ_DATA != 0 {
                header.flags |= F_CQ_DATA;
                header.data = entry.comp.data;
            }
            if entry.needs_receipt {
                header.flags |= F_DELIVERY_COMPLETE;
            }
            if matches!(entry.op, TxOp::FetchAtomic | TxOp::CompareAtomic) {
                header.flags |= F_FETCH;
            }
            if !handshake_sent {
                header.flags |= F_SRC_NAME;
            }

            let lane = match kind {
                TransportKind::Nic => &mut self.nic,
                TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
            };
            let frame = lane.tx_pkts.frame_mut(pkt);

            // Payload length is known up front: optional name prefix plus
            // either the atomic operands or the gathered user bytes.
            let body_len = match entry.atomic {
                Some(_) => AtomicReq::SIZE,
                None => entry.total_len,
            };
            let prefix = match handshake_sent {
                true => 0,
                false => EpName::SIZE,
            };
            header.payload_len = (prefix + body_len) as u16;

            let mut cursor = Cursor::new(&mut frame[..]);
            header.encode(&mut cursor).expect("header fits frame");
            if !handshake_sent {
                local_name.encode(&mut cursor).expect("name fits frame");
            }
            match entry.atomic {
                Some(atomic) => {
                    AtomicReq {
                        kind: atomic.kind,
                        operand: atomic.operand,
                        compare: atomic.compare,
                    }
                    .write(&mut cursor)
                    .expect("operands fit frame");
                }
                None => {
                    let position = cursor.position() as usize;
                    let frame = cursor.into_inner();
                    iov_gather(&entry.iov, 0, &mut frame[position..position + entry.total_len]);
                }
            }

            let acked = match entry.op {
                TxOp::FetchAtomic | TxOp::CompareAtomic => 0,
                _ => entry.total_len,
            };
            *lane.tx_pkts.meta_mut(pkt) = PktMeta {
                len: crate::wire::HDR_SIZE + prefix + body_len,
                entry: Some(EntryRef::Tx(tx)),
                peer: Some(dest),
                acked_bytes: acked,
            };
        }

        // The packet is committed once built; a bounced send replays this
        // exact frame, so the sent accounting moves now.
        {
            let entry = self.tx_entries.get_mut(tx.0).expect("entry");
            entry.bytes_sent = entry.total_len;
        }

        match self.send_pkt(kind, pkt, false) {
            Ok(()) => {
                let entry = self.tx_entries.get_mut(tx.0).expect("entry");
                entry.state = TxState::Send;
            }
            Err(XferError::Again) => self.queue_tx_pkt(tx, pkt, false),
            Err(XferError::Fault(fault)) => {
                self.lane_mut(kind).tx_pkts.release(pkt);
                self.fail_tx(tx, fault, 0);
            }
        }
    }

    /// Long-message request: take transfer credits and send the RTS. Without
    /// enough credits the entry parks on the control retry list.
    pub(crate) fn tx_long_init(&mut self, tx: TxId) {
        let (dest, kind, total_len, tagged, tag) = {
            let entry = self.tx_entries.get(tx.0).expect("entry");
            (
                entry.dest,
                entry.transport,
                entry.total_len,
                entry.op == TxOp::Tagged,
                entry.comp.tag,
            )
        };

        let max_payload = self.cfg.max_data_payload as u32;
        let min_credits = self.cfg.tx_min_credits;

        let (granted, request) = {
            let peer = self.peer_mut(dest);
            let outstanding = peer.outstanding(peer.transport());
            // Fair share of the peer's credit balance across its outstanding
            // transfers, floored by the configured minimum.
            let fair = (peer.tx_credits + outstanding) / (outstanding + 1);
            let need = (total_len as u64 + u64::from(max_payload) - 1) / u64::from(max_payload);
            let request = fair.min(need as u32).max(min_credits);
            (peer.take_credits(request), request)
        };

        {
            let entry = self.tx_entries.get_mut(tx.0).expect("entry");
            entry.proto = Proto::LongCts;
            entry.credit_request = match granted {
                true => request,
                false => 0,
            };
        }

        if !granted {
            logging::trace!(self.log, "credits exhausted, long send queued";
                            "context" => "tx_long",
                            "entry" => tx.0,
                            "requested" => request);
            self.park_tx_ctrl(tx);
            return;
        }

        let mut header = PktHeader::new(PktType::LongReq);
        header.tx_index = tx.0;
        header.total_len = total_len as u64;
        // The requested credit count rides in the offset field of REQ-class
        // packets.
        header.offset = u64::from(request);
        if tagged {
            header.flags |= F_TAGGED;
            header.aux = tag;
        }
        self.finish_req_header(tx, &mut header);

        self.send_req_pkt(tx, kind, dest, header, &[]);
    }

    /// Rendezvous request: register the source segments and describe them to
    /// the receiver, which pulls with one-sided reads. Falls back to the
    /// windowed protocol when registration fails.
    pub(crate) fn tx_read_rts(&mut self, tx: TxId) {
        let (dest, kind, total_len, tagged, tag) = {
            let entry = self.tx_entries.get(tx.0).expect("entry");
            (
                entry.dest,
                entry.transport,
                entry.total_len,
                entry.op == TxOp::Tagged,
                entry.comp.tag,
            )
        };

        let mut segs: Vec<(u64, u64)> = Vec::new();
        let mut handles = Vec::new();
        let mut failed = false;
        {
            let entry = self.tx_entries.get(tx.0).expect("entry");
            for seg in entry.iov.iter() {
                match self.registrar.register(seg, ACCESS_REMOTE) {
                    Ok(handle) => {
                        segs.push((self.registrar.rkey(handle), seg.len() as u64));
                        handles.push(handle);
                    }
                    Err(_) => {
                        failed = true;
                        break;
                    }
                }
            }
        }

        if failed {
            for handle in handles {
                self.registrar.release(handle);
            }
            logging::warn!(self.log, "segment registration failed, falling back to windowed protocol";
                           "context" => "tx_read_rts",
                           "entry" => tx.0);
            self.tx_long_init(tx);
            return;
        }

        {
            let entry = self.tx_entries.get_mut(tx.0).expect("entry");
            entry.proto = Proto::LongRead;
            entry.iov_mr_start = 0;
            entry.prov_mrs = handles;
        }

        let mut header = PktHeader::new(PktType::ReadRts);
        header.tx_index = tx.0;
        header.total_len = total_len as u64;
        if tagged {
            header.flags |= F_TAGGED;
            header.aux = tag;
        }
        self.finish_req_header(tx, &mut header);

        let mut table = vec![0u8; 2 + segs.len() * 16];
        {
            let mut cursor = Cursor::new(&mut table[..]);
            crate::wire::write_read_table(&segs, &mut cursor).expect("table fits");
        }

        self.send_req_pkt(tx, kind, dest, header, &table);
    }

    /// Rebuilds and resends a rendezvous RTS whose first attempt found no
    /// packet buffer. The segments are already registered.
    pub(crate) fn resend_read_rts(&mut self, tx: TxId) {
        let (dest, kind, total_len, tagged, tag, segs) = {
            let entry = self.tx_entries.get(tx.0).expect("entry");
            let segs: Vec<(u64, u64)> = entry
                .prov_mrs
                .iter()
                .zip(entry.iov.iter())
                .map(|(handle, seg)| (self.registrar.rkey(*handle), seg.len() as u64))
                .collect();
            (
                entry.dest,
                entry.transport,
                entry.total_len,
                entry.op == TxOp::Tagged,
                entry.comp.tag,
                segs,
            )
        };

        if segs.is_empty() {
            // Registration never happened; take the full path again.
            self.tx_read_rts(tx);
            return;
        }

        let mut header = PktHeader::new(PktType::ReadRts);
        header.tx_index = tx.0;
        header.total_len = total_len as u64;
        if tagged {
            header.flags |= F_TAGGED;
            header.aux = tag;
        }
        self.finish_req_header(tx, &mut header);

        let mut table = vec![0u8; 2 + segs.len() * 16];
        {
            let mut cursor = Cursor::new(&mut table[..]);
            crate::wire::write_read_table(&segs, &mut cursor).expect("table fits");
        }

        self.send_req_pkt(tx, kind, dest, header, &table);
    }

    /// Common REQ header tail: delivery-complete, remote CQ data, raw-name
    /// prefix flag.
    fn finish_req_header(&mut self, tx: TxId, header: &mut PktHeader) {
        let entry = self.tx_entries.get(tx.0).expect("entry");
        if entry.needs_receipt {
            header.flags |= F_DELIVERY_COMPLETE;
        }
        if entry.comp.flags & crate::comp::flags::REMOTE_CQ_DATA != 0 {
            header.flags |= F_CQ_DATA;
            header.data = entry.comp.data;
        }

        let dest = entry.dest;
        if !self.peer_mut(dest).handshake_sent {
            header.flags |= F_SRC_NAME;
        }
    }

    /// Builds and sends a REQ-class packet (payload = optional name prefix +
    /// `body`), parking the entry on control retry when the transport pushes
    /// back.
    fn send_req_pkt(
        &mut self,
        tx: TxId,
        kind: TransportKind,
        dest: RemoteAddr,
        mut header: PktHeader,
        body: &[u8],
    ) {
        let local_name = self.name.expect("endpoint enabled");
        let with_name = header.has(F_SRC_NAME);
        let prefix = match with_name {
            true => EpName::SIZE,
            false => 0,
        };

        let pkt = match self.lane_mut(kind).tx_pkts.acquire() {
            Some(pkt) => pkt,
            None => {
                self.refund_tx_credits(tx);
                self.park_tx_ctrl(tx);
                return;
            }
        };

        header.payload_len = (prefix + body.len()) as u16;

        {
            let lane = match kind {
                TransportKind::Nic => &mut self.nic,
                TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
            };
            let frame = lane.tx_pkts.frame_mut(pkt);
            let mut cursor = Cursor::new(&mut frame[..]);
            header.encode(&mut cursor).expect("header fits frame");
            if with_name {
                local_name.encode(&mut cursor).expect("name fits frame");
            }
            let position = cursor.position() as usize;
            let frame = cursor.into_inner();
            frame[position..position + body.len()].copy_from_slice(body);

            *lane.tx_pkts.meta_mut(pkt) = PktMeta {
                len: crate::wire::HDR_SIZE + prefix + body.len(),
                entry: Some(EntryRef::Tx(tx)),
                peer: Some(dest),
                acked_bytes: 0,
            };
        }

        match self.send_pkt(kind, pkt, false) {
            Ok(()) => {}
            Err(XferError::Again) => self.queue_tx_pkt(tx, pkt, true),
            Err(XferError::Fault(fault)) => {
                self.lane_mut(kind).tx_pkts.release(pkt);
                self.fail_tx(tx, fault, 0);
            }
        }
    }

    fn refund_tx_credits(&mut self, tx: TxId) {
        let (dest, taken) = {
            let entry = self.tx_entries.get_mut(tx.0).expect("entry");
            let taken = entry.credit_request;
            entry.credit_request = 0;
            (entry.dest, taken)
        };
        if taken > 0 {
            if let Some(peer) = self.av_mut().peer_mut(dest) {
                peer.refund_credits(taken);
            }
        }
    }

    /// Parks a pkt-less entry on the peer's control retry list.
    fn park_tx_ctrl(&mut self, tx: TxId) {
        let dest = {
            let entry = self.tx_entries.get_mut(tx.0).expect("entry");
            entry.state = TxState::QueuedCtrl;
            entry.dest
        };

        let peer = self.peer_mut(dest);
        if !peer.tx_ctrl.contains(&tx) {
            peer.tx_ctrl.push_back(tx);
        }
    }

    /// Parks a bounced packet on its entry and links the entry on the
    /// matching retry list. `ctrl` selects the control list over the replay
    /// list.
    pub(crate) fn queue_tx_pkt(&mut self, tx: TxId, pkt: PktId, ctrl: bool) {
        let dest = {
            let entry = self.tx_entries.get_mut(tx.0).expect("entry");
            entry.queued_pkts.push_back(pkt);
            if !matches!(entry.state, TxState::QueuedCtrl | TxState::QueuedRnr) {
                entry.state = match ctrl {
                    true => TxState::QueuedCtrl,
                    false => TxState::QueuedRnr,
                };
            }
            entry.dest
        };

        let state = self.tx_entries.get(tx.0).expect("entry").state;
        let peer = self.peer_mut(dest);
        match state {
            TxState::QueuedCtrl => {
                if !peer.tx_ctrl.contains(&tx) {
                    peer.tx_ctrl.push_back(tx);
                }
            }
            _ => {
                if !peer.tx_rnr.contains(&tx) {
                    peer.tx_rnr.push_back(tx);
                }
            }
        }
    }

    pub(crate) fn queue_rx_pkt(&mut self, rx: RxId, pkt: PktId, ctrl: bool) {
        let peer_addr = {
            let entry = self.rx_entries.get_mut(rx.0).expect("entry");
            entry.queued_pkts.push_back(pkt);
            if !matches!(entry.state, RxState::QueuedCtrl | RxState::QueuedRnr) {
                entry.state = match ctrl {
                    true => RxState::QueuedCtrl,
                    false => RxState::QueuedRnr,
                };
            }
            entry.peer.expect("matched receive has a peer")
        };

        let state = self.rx_entries.get(rx.0).expect("entry").state;
        let peer = self.peer_mut(peer_addr);
        match state {
            RxState::QueuedCtrl => {
                if !peer.rx_ctrl.contains(&rx) {
                    peer.rx_ctrl.push_back(rx);
                }
            }
            _ => {
                if !peer.rx_rnr.contains(&rx) {
                    peer.rx_rnr.push_back(rx);
                }
            }
        }
    }

    /// Posts a single packet to its transport. On success the packet joins
    /// the peer's outstanding set and every counter moves; on back-pressure
    /// the caller keeps ownership and re-queues.
    pub(crate) fn send_pkt(&mut self, kind: TransportKind, pkt: PktId, more: bool) -> XferResult<()> {
        let registrar = self.registrar.as_ref();
        let lane = match kind {
            TransportKind::Nic => &mut self.nic,
            TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
        };

        let meta = *lane.tx_pkts.meta(pkt);
        let addr = meta.peer.expect("packet without destination");

        let av = self.av.as_mut().expect("address vector bound");
        let peer = av
            .peer_mut(addr)
            .ok_or(XferError::Fault(FaultKind::UnknownAddr))?;
        let dest = peer.name.source();
        let desc = lane.tx_pkts.desc(pkt, registrar);

        lane.tr
            .post_send(dest, lane.tx_pkts.filled(pkt), desc, wr::pkt(pkt), more)?;

        peer.outstanding_pkts.insert(pkt);
        peer.bump_outstanding(kind);
        peer.settle_backoff();
        lane.outstanding += 1;
        lane.more_pending = more;

        match meta.entry {
            Some(EntryRef::Tx(tx)) => {
                if let Some(entry) = self.tx_entries.get_mut(tx.0) {
                    entry.outstanding += 1;
                }
            }
            Some(EntryRef::Rx(rx)) => {
                if let Some(entry) = self.rx_entries.get_mut(rx.0) {
                    entry.outstanding += 1;
                }
            }
            None => {}
        }

        Ok(())
    }

    /// Posts data packets for one pending long transfer until its window,
    /// the unsent bytes or the peer's outstanding quota runs out. Returns
    /// true when the entry no longer belongs on the pending list.
    pub(crate) fn tx_fill_window(&mut self, tx: TxId, now: std::time::Instant) -> bool {
        loop {
            let (kind, dest, window, unsent, state, failed) = {
                let entry = match self.tx_entries.get(tx.0) {
                    Some(entry) => entry,
                    None => return true,
                };
                (
                    entry.transport,
                    entry.dest,
                    entry.window,
                    entry.unsent(),
                    entry.state,
                    entry.failed,
                )
            };

            if failed {
                return true;
            }
            if matches!(state, TxState::QueuedCtrl | TxState::QueuedRnr) {
                // Bounced packets replay first; the window picks up after.
                return false;
            }
            if unsent == 0 {
                return true;
            }
            if window == 0 {
                // Waiting on a window extension; the CTS handler re-links.
                return true;
            }

            let quota = self.lane_mut(kind).tr.max_outstanding() as u32;
            {
                let peer = self.peer_mut(dest);
                if peer.failed {
                    return true;
                }
                if peer.in_backoff(now) || peer.outstanding(kind) >= quota {
                    return false;
                }
            }

            let payload = self.cfg.max_data_payload.min(window).min(unsent);
            let last = payload == window || payload == unsent;

            let pkt = match self.lane_mut(kind).tx_pkts.acquire() {
                Some(pkt) => pkt,
                None => return false,
            };

            {
                let entry = self.tx_entries.get(tx.0).expect("entry");

                let mut header = match entry.op {
                    TxOp::Write => {
                        let rma = entry.rma.expect("write carries target coordinates");
                        let mut header = PktHeader::new(PktType::Write);
                        header.aux = rma.key;
                        header.offset = rma.offset + entry.bytes_sent as u64;
                        let final_chunk = entry.bytes_sent + payload == entry.total_len;
                        if final_chunk && entry.needs_receipt {
                            header.flags |= F_DELIVERY_COMPLETE;
                        }
                        if final_chunk && entry.comp.flags & crate::comp::flags::REMOTE_CQ_DATA != 0 {
                            header.flags |= F_CQ_DATA;
                            header.data = entry.comp.data;
                        }
                        header
                    }
                    _ => {
                        let mut header = PktHeader::new(PktType::Data);
                        header.rx_index = entry.remote_rx;
                        header.offset = entry.bytes_sent as u64;
                        header
                    }
                };
                header.tx_index = tx.0;
                header.total_len = entry.total_len as u64;
                header.payload_len = payload as u16;

                let lane = match kind {
                    TransportKind::Nic => &mut self.nic,
                    TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
                };
                let frame = lane.tx_pkts.frame_mut(pkt);
                let mut cursor = Cursor::new(&mut frame[..]);
                header.encode(&mut cursor).expect("header fits frame");
                let position = cursor.position() as usize;
                let frame = cursor.into_inner();
                iov_gather(&entry.iov, entry.bytes_sent, &mut frame[position..position + payload]);

                *lane.tx_pkts.meta_mut(pkt) = PktMeta {
                    len: crate::wire::HDR_SIZE + payload,
                    entry: Some(EntryRef::Tx(tx)),
                    peer: Some(dest),
                    acked_bytes: payload,
                };
            }

            // The frame is committed: a bounced send replays it verbatim, so
            // the cursor and window accounting move before the post.
            {
                let entry = self.tx_entries.get_mut(tx.0).expect("entry");
                let crate::entry::TxEntry {
                    ref iov,
                    ref mut cursor,
                    ..
                } = *entry;
                cursor.advance(iov, payload);
                entry.bytes_sent += payload;
                entry.window -= payload;
            }

            // Data packets batch behind the more flag; the last packet of a
            // burst (or the end-of-tick flush) rings the doorbell.
            match self.send_pkt(kind, pkt, !last) {
                Ok(()) => {
                    self.tx_entries.get_mut(tx.0).expect("entry").state = TxState::Send;
                }
                Err(XferError::Again) => {
                    self.queue_tx_pkt(tx, pkt, false);
                    return false;
                }
                Err(XferError::Fault(fault)) => {
                    self.lane_mut(kind).tx_pkts.release(pkt);
                    self.fail_tx(tx, fault, 0);
                    return true;
                }
            }
        }
    }

    /// Replays a queued entry's parked packets in order. `Again` leaves the
    /// rest parked for the next tick.
    pub(crate) fn replay_queued(&mut self, eref: EntryRef) -> XferResult<()> {
        loop {
            let (pkt, kind) = {
                let (front, kind) = match eref {
                    EntryRef::Tx(tx) => {
                        let entry = match self.tx_entries.get(tx.0) {
                            Some(entry) => entry,
                            None => return Ok(()),
                        };
                        (entry.queued_pkts.front().copied(), entry.transport)
                    }
                    EntryRef::Rx(rx) => {
                        let entry = match self.rx_entries.get(rx.0) {
                            Some(entry) => entry,
                            None => return Ok(()),
                        };
                        (entry.queued_pkts.front().copied(), entry.transport)
                    }
                };

                match front {
                    Some(pkt) => (pkt, kind),
                    None => break,
                }
            };

            match self.send_pkt(kind, pkt, false) {
                Ok(()) => match eref {
                    EntryRef::Tx(tx) => {
                        self.tx_entries.get_mut(tx.0).expect("entry").queued_pkts.pop_front();
                    }
                    EntryRef::Rx(rx) => {
                        self.rx_entries.get_mut(rx.0).expect("entry").queued_pkts.pop_front();
                    }
                },
                Err(XferError::Again) => return Err(XferError::Again),
                Err(XferError::Fault(fault)) => {
                    match eref {
                        EntryRef::Tx(tx) => self.fail_tx(tx, fault, 0),
                        EntryRef::Rx(rx) => self.fail_rx(rx, fault, 0),
                    }
                    return Err(XferError::Fault(fault));
                }
            }
        }

        // Drained: the entry resumes its normal state.
        match eref {
            EntryRef::Tx(tx) => {
                if let Some(entry) = self.tx_entries.get_mut(tx.0) {
                    entry.state = match entry.bytes_sent {
                        0 => TxState::Req,
                        _ => TxState::Send,
                    };
                }
            }
            EntryRef::Rx(rx) => {
                if let Some(entry) = self.rx_entries.get_mut(rx.0) {
                    entry.state = RxState::Recv;
                }
            }
        }

        Ok(())
    }

    /// Builds a control packet into the transmit pool of `kind`. Returns
    /// `None` on pool exhaustion.
    pub(crate) fn build_ctrl_pkt(
        &mut self,
        kind: TransportKind,
        mut header: PktHeader,
        payload: &[u8],
        owner: Option<EntryRef>,
        peer: RemoteAddr,
    ) -> Option<PktId> {
        let lane = match kind {
            TransportKind::Nic => &mut self.nic,
            TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
        };

        let pkt = lane.tx_pkts.acquire()?;
        header.payload_len = payload.len() as u16;

        let frame = lane.tx_pkts.frame_mut(pkt);
        let mut cursor = Cursor::new(&mut frame[..]);
        header.encode(&mut cursor).expect("header fits frame");
        let position = cursor.position() as usize;
        let frame = cursor.into_inner();
        frame[position..position + payload.len()].copy_from_slice(payload);

        *lane.tx_pkts.meta_mut(pkt) = PktMeta {
            len: crate::wire::HDR_SIZE + payload.len(),
            entry: owner,
            peer: Some(peer),
            acked_bytes: 0,
        };

        Some(pkt)
    }

    /// Sends a control packet owned by a receive entry, parking it on the
    /// control retry list when the transport pushes back.
    pub(crate) fn send_rx_ctrl(&mut self, rx: RxId, kind: TransportKind, pkt: PktId) {
        match self.send_pkt(kind, pkt, false) {
            Ok(()) => {}
            Err(XferError::Again) => self.queue_rx_pkt(rx, pkt, true),
            Err(XferError::Fault(fault)) => {
                self.lane_mut(kind).tx_pkts.release(pkt);
                self.fail_rx(rx, fault, 0);
            }
        }
    }

    /// Sends an entry-less control packet (receipts, atomic responses).
    /// Bounced packets go to the endpoint control queue for replay.
    pub(crate) fn send_loose_ctrl(&mut self, kind: TransportKind, pkt: PktId) {
        match self.send_pkt(kind, pkt, false) {
            Ok(()) => {}
            Err(XferError::Again) => self.ctrl_queue.push_back((kind, pkt)),
            Err(XferError::Fault(fault)) => {
                self.lane_mut(kind).tx_pkts.release(pkt);
                logging::error!(self.log, "control packet dropped on terminal fault";
                                "context" => "send_ctrl",
                                "fault" => ?fault);
            }
        }
    }

    /// Builds and posts the handshake for a peer. `Again` leaves the peer
    /// queued for the next tick.
    pub(crate) fn send_handshake(&mut self, addr: RemoteAddr) -> XferResult<()> {
        let local_name = self.name.expect("endpoint enabled");
        let features = self.features;
        let credits = self.cfg.peer_credits;

        let (kind, reply) = {
            let peer = self.peer_mut(addr);
            (peer.transport(), peer.handshake_reply)
        };

        let mut header = PktHeader::new(PktType::Handshake);
        if reply {
            header.flags |= F_REPLY;
        }

        let mut payload = vec![0u8; Handshake::SIZE];
        {
            let mut cursor = Cursor::new(&mut payload[..]);
            Handshake {
                name: local_name,
                version: lodestone::VERSION_ID,
                features,
                credits,
                protocol: lodestone::PROTOCOL_ID,
            }
            .write(&mut cursor)
            .expect("handshake fits");
        }

        let pkt = match self.build_ctrl_pkt(kind, header, &payload, None, addr) {
            Some(pkt) => pkt,
            None => return Err(XferError::Again),
        };

        match self.send_pkt(kind, pkt, false) {
            Ok(()) => {
                let peer = self.peer_mut(addr);
                peer.handshake_queued = false;
                peer.handshake_sent = true;
                peer.handshake_reply = false;
                logging::debug!(peer.log, "handshake posted"; "context" => "handshake", "reply" => reply);
                Ok(())
            }
            Err(XferError::Again) => {
                self.lane_mut(kind).tx_pkts.release(pkt);
                Err(XferError::Again)
            }
            Err(XferError::Fault(fault)) => {
                self.lane_mut(kind).tx_pkts.release(pkt);
                self.fail_peer(addr, fault);
                Err(XferError::Fault(fault))
            }
        }
    }

    /// Posts one provider receive buffer as a wildcard receive.
    pub(crate) fn post_internal_recv(&mut self, kind: TransportKind, more: bool) -> XferResult<()> {
        let lane = match kind {
            TransportKind::Nic => &mut self.nic,
            TransportKind::Shm => self.shm.as_mut().expect("shm lane"),
        };

        let pkt = match lane.rx_pkts.acquire() {
            Some(pkt) => pkt,
            None => return Err(XferError::Again),
        };

        let capacity = lane.rx_pkts.frame(pkt).len();
        match lane.tr.post_recv(wr::pkt(pkt), capacity, more) {
            Ok(()) => {
                lane.posted_rx += 1;
                Ok(())
            }
            Err(err) => {
                lane.rx_pkts.release(pkt);
                Err(err)
            }
        }
    }

    /// Posts `count` buffers, letting the transport defer its doorbell until
    /// the last one.
    pub(crate) fn bulk_post_internal_recv(&mut self, count: usize, kind: TransportKind) {
        for index in 0..count {
            let more = index + 1 < count;
            if self.post_internal_recv(kind, more).is_err() {
                // A partial batch still needs its doorbell.
                if index > 0 {
                    self.lane_mut(kind).tr.flush();
                }
                return;
            }
        }
    }

    /// Zero-copy receive: posts the entry's own buffer so an in-order eager
    /// payload lands without a bounce through the provider pool.
    pub(crate) fn post_user_recv(&mut self, rx: RxId) -> XferResult<()> {
        let capacity = {
            let entry = self.rx_entries.get(rx.0).expect("entry");
            entry.iov.first().map(|seg| seg.len()).unwrap_or(0) + crate::wire::HDR_SIZE
        };

        let lane = &mut self.nic;
        lane.tr.post_recv(wr::user_rx(rx), capacity, false)?;

        self.rx_entries.get_mut(rx.0).expect("entry").outstanding += 1;
        Ok(())
    }

    /// Rings the doorbell on every lane with batched work. Always the last
    /// step of a progress tick.
    pub(crate) fn flush_lanes(&mut self) {
        if self.nic.more_pending {
            self.nic.tr.flush();
            self.nic.more_pending = false;
        }
        if let Some(lane) = self.shm.as_mut() {
            if lane.more_pending {
                lane.tr.flush();
                lane.more_pending = false;
            }
        }
    }
}
