use crate::mr::{MrDesc, MrHandle};
use crate::pool::PktId;
use crate::resolve::RemoteAddr;
use crate::transport::TransportKind;
use std::collections::VecDeque;

/// Segment count limit for a single operation's IO vector.
pub const IOV_LIMIT: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct TxId(pub u32);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct RxId(pub u32);

/// Weak reference from a packet back to the transfer entry that owns it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryRef {
    Tx(TxId),
    Rx(RxId),
}

/// Flat byte length of an IO vector.
#[inline]
pub fn iov_len(iov: &[Vec<u8>]) -> usize {
    iov.iter().map(|seg| seg.len()).sum()
}

/// Copies bytes out of `iov` starting at flat `offset`, filling as much of
/// `dst` as the vector allows. Returns the copied count.
pub fn iov_gather(iov: &[Vec<u8>], offset: usize, dst: &mut [u8]) -> usize {
    let mut skipped = 0;
    let mut copied = 0;

    for seg in iov {
        let seg_start = skipped;
        skipped += seg.len();

        if skipped <= offset {
            continue;
        }

        let from = offset.max(seg_start) - seg_start;
        let take = (seg.len() - from).min(dst.len() - copied);
        dst[copied..copied + take].copy_from_slice(&seg[from..from + take]);
        copied += take;

        if copied == dst.len() {
            break;
        }
    }

    copied
}

/// Copies `src` into `iov` at flat `offset`. Returns the copied count, which
/// is short only when the vector runs out of room.
pub fn iov_scatter(iov: &mut [Vec<u8>], offset: usize, src: &[u8]) -> usize {
    let mut skipped = 0;
    let mut copied = 0;

    for seg in iov {
        let seg_start = skipped;
        skipped += seg.len();

        if skipped <= offset {
            continue;
        }

        let from = offset.max(seg_start) - seg_start;
        let take = (seg.len() - from).min(src.len() - copied);
        seg[from..from + take].copy_from_slice(&src[copied..copied + take]);
        copied += take;

        if copied == src.len() {
            break;
        }
    }

    copied
}

/// Position within an IO vector, kept so fragmentation does not rescan the
/// segment list for every packet.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IovCursor {
    pub seg: usize,
    pub offset: usize,
}

impl IovCursor {
    #[inline]
    pub fn start() -> IovCursor {
        IovCursor { seg: 0, offset: 0 }
    }

    /// Advances the cursor by `count` bytes.
    pub fn advance(&mut self, iov: &[Vec<u8>], mut count: usize) {
        while count > 0 && self.seg < iov.len() {
            let left = iov[self.seg].len() - self.offset;

            if count < left {
                self.offset += count;
                return;
            }

            count -= left;
            self.seg += 1;
            self.offset = 0;
        }
    }
}

/// What the user gets back when the operation finishes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CompDesc {
    pub context: u64,
    pub flags: u64,
    pub data: u64,
    pub len: usize,
    pub tag: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TxOp {
    Msg,
    Tagged,
    Write,
    Read,
    Atomic,
    FetchAtomic,
    CompareAtomic,
}

/// Wire protocol chosen for a transmit entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Proto {
    /// Whole payload in one packet.
    Eager,
    /// Segmented, paced by receiver-granted window.
    LongCts,
    /// Rendezvous: the receiver pulls the payload with one-sided reads.
    LongRead,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TxState {
    /// Created, nothing handed to a transport yet.
    Req,
    /// At least one packet handed to a transport.
    Send,
    /// A control packet could not be posted; parked on the peer's control
    /// retry list.
    QueuedCtrl,
    /// Packets bounced with back-pressure; parked on the peer's replay list.
    QueuedRnr,
}

/// One-sided target coordinates.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RmaSpec {
    pub key: u64,
    pub offset: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AtomicSpec {
    pub kind: crate::wire::AtomicKind,
    pub operand: u64,
    pub compare: u64,
}

/// One outbound operation.
pub struct TxEntry {
    pub index: TxId,
    pub op: TxOp,
    pub proto: Proto,
    pub dest: RemoteAddr,
    /// Transport the destination peer lives on.
    pub transport: TransportKind,

    pub iov: Vec<Vec<u8>>,
    pub user_desc: Vec<MrDesc>,
    /// Registrations this endpoint created for the long paths. Released
    /// before the entry returns to its pool.
    pub prov_mrs: Vec<MrHandle>,
    /// Index of the first provider-created registration within the parallel
    /// registration arrays.
    pub iov_mr_start: usize,

    pub total_len: usize,
    pub bytes_sent: usize,
    pub bytes_acked: usize,
    /// Flow-control credit for the long protocol, in bytes.
    pub window: usize,
    pub cursor: IovCursor,

    pub state: TxState,
    pub credit_request: u32,

    pub comp: CompDesc,
    pub queued_pkts: VecDeque<PktId>,
    /// Packets handed to a transport and not yet completed.
    pub outstanding: u32,

    pub rma: Option<RmaSpec>,
    pub atomic: Option<AtomicSpec>,

    pub needs_receipt: bool,
    pub receipt_seen: bool,

    /// Receiver-side entry slot, learned from the first CTS.
    pub remote_rx: u32,
    /// A terminal fault was recorded and the error completion written; the
    /// entry drains silently and is released once quiescent.
    pub failed: bool,
}

impl TxEntry {
    pub fn new(index: TxId, op: TxOp, dest: RemoteAddr, iov: Vec<Vec<u8>>, comp: CompDesc) -> TxEntry {
        let total_len = iov_len(&iov);

        TxEntry {
            index,
            op,
            proto: Proto::Eager,
            dest,
            transport: TransportKind::Nic,
            iov,
            user_desc: Vec::new(),
            prov_mrs: Vec::new(),
            iov_mr_start: 0,
            total_len,
            bytes_sent: 0,
            bytes_acked: 0,
            window: 0,
            cursor: IovCursor::start(),
            state: TxState::Req,
            credit_request: 0,
            comp,
            queued_pkts: VecDeque::new(),
            outstanding: 0,
            rma: None,
            atomic: None,
            needs_receipt: false,
            receipt_seen: false,
            remote_rx: 0,
            failed: false,
        }
    }

    #[inline]
    pub fn unsent(&self) -> usize {
        self.total_len - self.bytes_sent
    }

    /// Terminal test: everything acknowledged, nothing in flight, nothing
    /// queued, and the receipt seen when one was requested.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bytes_acked == self.total_len
            && self.outstanding == 0
            && self.queued_pkts.is_empty()
            && (!self.needs_receipt || self.receipt_seen)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RxState {
    /// Created from an application post, not yet matched.
    Init,
    /// Created from an unexpected arrival, awaiting a matching post.
    Unexp,
    /// Source and tag resolved; the IO vector is known.
    Matched,
    /// Data flowing.
    Recv,
    QueuedCtrl,
    QueuedRnr,
}

/// Multi-receive parent accounting. The parent carves one consumer child per
/// arriving message until its remaining capacity drops below the configured
/// threshold.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MultiState {
    pub remaining: usize,
    pub consumers: u32,
    pub cancelled: bool,
}

/// One posted or matched receive.
pub struct RxEntry {
    pub index: RxId,
    /// Directed source, `None` for wildcard posts.
    pub src: Option<RemoteAddr>,
    /// Resolved peer once matched.
    pub peer: Option<RemoteAddr>,
    /// Transport the triggering packet arrived on.
    pub transport: TransportKind,

    pub iov: Vec<Vec<u8>>,
    /// Capacity of the IO vector.
    pub total_len: usize,
    /// Sender's transfer length, known from the REQ-class packet.
    pub expected_len: usize,
    pub bytes_received: usize,
    pub cursor: IovCursor,

    pub state: RxState,
    pub tagged: bool,
    pub tag: u64,
    pub ignore: u64,

    pub comp: CompDesc,
    pub queued_pkts: VecDeque<PktId>,
    /// Packet retained from an unexpected arrival until a matching post
    /// consumes it.
    pub unexp_pkt: Option<PktId>,
    pub outstanding: u32,

    /// Sender-side entry slot, echoed in control packets so the sender finds
    /// its entry without a lookup.
    pub remote_tx: u32,
    /// Unconsumed window this receiver granted, in bytes.
    pub window_open: usize,
    /// Size of the last grant, the refill trigger reference.
    pub window_grant: usize,

    pub parent: Option<RxId>,
    pub multi: Option<MultiState>,

    /// Rendezvous segment table from a read RTS, drained as the reads post.
    pub read_segs: Vec<(u64, u64)>,
    /// Next rendezvous segment to post a read for.
    pub read_posted: usize,
    /// A terminal control packet (receipt or end-of-read) is still owed to
    /// the sender. Cleared once the packet is built; the packet itself covers
    /// retransmission from then on.
    pub send_receipt: bool,

    /// Set by cancellation of an entry that was already receiving: further
    /// arrivals are discarded and no user completion is written.
    pub cancel_suppressed: bool,
    /// Mirrors `TxEntry::failed`.
    pub failed: bool,
}

impl RxEntry {
    pub fn new(
        index: RxId,
        src: Option<RemoteAddr>,
        iov: Vec<Vec<u8>>,
        tagged: bool,
        tag: u64,
        ignore: u64,
        comp: CompDesc,
    ) -> RxEntry {
        let total_len = iov_len(&iov);

        RxEntry {
            index,
            src,
            peer: None,
            transport: TransportKind::Nic,
            iov,
            total_len,
            expected_len: 0,
            bytes_received: 0,
            cursor: IovCursor::start(),
            state: RxState::Init,
            tagged,
            tag,
            ignore,
            comp,
            queued_pkts: VecDeque::new(),
            unexp_pkt: None,
            outstanding: 0,
            remote_tx: 0,
            window_open: 0,
            window_grant: 0,
            parent: None,
            multi: None,
            read_segs: Vec::new(),
            read_posted: 0,
            send_receipt: false,
            cancel_suppressed: false,
            failed: false,
        }
    }

    /// Whether an arrival with this identity lands in this posted entry.
    #[inline]
    pub fn matches(&self, src: RemoteAddr, tagged: bool, tag: u64) -> bool {
        if self.tagged != tagged {
            return false;
        }

        if let Some(directed) = self.src {
            if directed != src {
                return false;
            }
        }

        !self.tagged || (self.tag ^ tag) & !self.ignore == 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.expected_len
            && self.outstanding == 0
            && self.queued_pkts.is_empty()
            && !self.send_receipt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iov(sizes: &[usize]) -> Vec<Vec<u8>> {
        sizes.iter().map(|&size| vec![0u8; size]).collect()
    }

    fn comp() -> CompDesc {
        CompDesc {
            context: 1,
            flags: 0,
            data: 0,
            len: 0,
            tag: 0,
        }
    }

    #[test]
    fn test_iov_gather_spans_segments() {
        let iov = vec![vec![1u8, 2, 3], vec![4, 5], vec![6, 7, 8, 9]];

        let mut dst = [0u8; 4];
        assert_eq!(iov_gather(&iov, 2, &mut dst), 4);
        assert_eq!(dst, [3, 4, 5, 6]);

        let mut tail = [0u8; 8];
        assert_eq!(iov_gather(&iov, 7, &mut tail), 2);
        assert_eq!(&tail[..2], &[8, 9]);
    }

    #[test]
    fn test_iov_scatter_spans_segments() {
        let mut iov = iov(&[3, 2, 4]);

        assert_eq!(iov_scatter(&mut iov, 2, &[9, 9, 9]), 3);
        assert_eq!(iov[0], vec![0, 0, 9]);
        assert_eq!(iov[1], vec![9, 9]);
        assert_eq!(iov[2], vec![0, 0, 0, 0]);

        // Runs out of room at the end
        assert_eq!(iov_scatter(&mut iov, 8, &[1, 1, 1]), 1);
    }

    #[test]
    fn test_cursor_advance() {
        let iov = iov(&[4, 4, 4]);
        let mut cursor = IovCursor::start();

        cursor.advance(&iov, 3);
        assert_eq!(cursor, IovCursor { seg: 0, offset: 3 });

        cursor.advance(&iov, 1);
        assert_eq!(cursor, IovCursor { seg: 1, offset: 0 });

        cursor.advance(&iov, 6);
        assert_eq!(cursor, IovCursor { seg: 2, offset: 2 });

        cursor.advance(&iov, 10);
        assert_eq!(cursor.seg, 3);
    }

    #[test]
    fn test_tx_terminal_requires_quiescence() {
        let mut tx = TxEntry::new(TxId(0), TxOp::Msg, RemoteAddr(0), iov(&[8]), comp());
        assert!(!tx.is_complete());

        tx.bytes_sent = 8;
        tx.bytes_acked = 8;
        tx.outstanding = 1;
        assert!(!tx.is_complete());

        tx.outstanding = 0;
        assert!(tx.is_complete());

        tx.needs_receipt = true;
        assert!(!tx.is_complete());
        tx.receipt_seen = true;
        assert!(tx.is_complete());
    }

    #[test]
    fn test_rx_matching() {
        let posted = RxEntry::new(RxId(0), None, iov(&[16]), false, 0, 0, comp());
        assert!(posted.matches(RemoteAddr(3), false, 0));
        assert!(!posted.matches(RemoteAddr(3), true, 0));

        let directed = RxEntry::new(RxId(1), Some(RemoteAddr(2)), iov(&[16]), false, 0, 0, comp());
        assert!(directed.matches(RemoteAddr(2), false, 0));
        assert!(!directed.matches(RemoteAddr(3), false, 0));

        let tagged = RxEntry::new(RxId(2), None, iov(&[16]), true, 0xab00, 0x00ff, comp());
        assert!(tagged.matches(RemoteAddr(1), true, 0xab42));
        assert!(!tagged.matches(RemoteAddr(1), true, 0xcd42));
    }
}
