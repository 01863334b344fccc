use crate::mr::MrDesc;
use crate::resolve::EpName;
use lodestone::shared::XferResult;

/// Which fabric a packet or counter belongs to. The shared-memory transport
/// carries node-local traffic; everything else rides the NIC.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportKind {
    Nic,
    Shm,
}

/// NIC-level source identity attached to receive completions.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SourceId {
    pub slid: u32,
    pub qpn: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CqOp {
    Send,
    Recv,
    Read,
}

/// Successful completion drained from a transport queue. For receive and read
/// completions `bytes` carries the arriving datagram; the completion layer
/// lands it in the posted buffer named by `wr_id`.
#[derive(Debug)]
pub struct CqEntry {
    pub wr_id: u64,
    pub op: CqOp,
    pub len: usize,
    pub src: Option<SourceId>,
    pub bytes: Vec<u8>,
}

/// Error completion. `rnr` marks receiver-not-ready back-pressure, which is
/// retryable; anything else is terminal for the owning transfer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CqErr {
    pub wr_id: u64,
    pub op: CqOp,
    pub rnr: bool,
    pub code: i32,
}

/// One unreliable fixed-MTU datagram fabric.
///
/// Posted work is owned by the transport between submission and completion;
/// the endpoint does not touch a posted frame until its `wr_id` comes back
/// through `drain_cq` or `drain_err`. Posts flagged `more` may be held back
/// until a post without the flag or an explicit `flush` rings the doorbell;
/// held posts are delivered in submission order.
pub trait Transport {
    /// Brings the queue pair up and returns the local raw endpoint name.
    fn enable(&mut self) -> XferResult<EpName>;

    fn mtu(&self) -> usize;

    /// Outstanding-send quota per peer.
    fn max_outstanding(&self) -> usize;

    fn supports_read(&self) -> bool;

    fn post_send(
        &mut self,
        dest: SourceId,
        frame: &[u8],
        desc: Option<MrDesc>,
        wr_id: u64,
        more: bool,
    ) -> XferResult<()>;

    fn post_recv(&mut self, wr_id: u64, capacity: usize, more: bool) -> XferResult<()>;

    fn post_read(
        &mut self,
        dest: SourceId,
        key: u64,
        offset: u64,
        len: usize,
        desc: Option<MrDesc>,
        wr_id: u64,
    ) -> XferResult<()>;

    /// Drains up to `max` completions into `out`, returning the count.
    fn drain_cq(&mut self, out: &mut Vec<CqEntry>, max: usize) -> usize;

    /// Drains error completions. Kept separate from the success path per the
    /// queue semantics of the underlying fabric.
    fn drain_err(&mut self, out: &mut Vec<CqErr>, max: usize) -> usize;

    /// Flushes any sends held back by the `more` flag.
    fn flush(&mut self);

    fn shutdown(&mut self);
}

/// Work-request id packing: one tag byte, a 24-bit auxiliary field and the
/// slot index of the owning object. The id is the only context the fabric
/// hands back, so it must be enough to find the owner without a lookup table.
pub mod wr {
    use crate::entry::{RxId, TxId};
    use crate::pool::PktId;

    const PKT: u64 = 1;
    const USER_RX: u64 = 2;
    const READ_RX: u64 = 3;
    const READ_TX: u64 = 4;

    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub enum Target {
        /// A provider packet buffer.
        Pkt(PktId),
        /// A user receive buffer posted directly (zero-copy mode).
        UserRx(RxId),
        /// One segment of a rendezvous read, receiver side.
        ReadRx(RxId, u32),
        /// An application RMA read.
        ReadTx(TxId),
    }

    #[inline]
    pub fn pkt(id: PktId) -> u64 {
        PKT << 56 | u64::from(id.0)
    }

    #[inline]
    pub fn user_rx(id: RxId) -> u64 {
        USER_RX << 56 | u64::from(id.0)
    }

    #[inline]
    pub fn read_rx(id: RxId, seg: u32) -> u64 {
        READ_RX << 56 | u64::from(seg & 0x00ff_ffff) << 32 | u64::from(id.0)
    }

    #[inline]
    pub fn read_tx(id: TxId) -> u64 {
        READ_TX << 56 | u64::from(id.0)
    }

    #[inline]
    pub fn unpack(wr_id: u64) -> Target {
        let index = (wr_id & 0xffff_ffff) as u32;
        let aux = ((wr_id >> 32) & 0x00ff_ffff) as u32;

        match wr_id >> 56 {
            PKT => Target::Pkt(PktId(index)),
            USER_RX => Target::UserRx(RxId(index)),
            READ_RX => Target::ReadRx(RxId(index), aux),
            READ_TX => Target::ReadTx(TxId(index)),
            tag => panic!("corrupt work request id tag {}", tag),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::wr;
    use crate::entry::{RxId, TxId};
    use crate::pool::PktId;

    #[test]
    fn test_wr_id_roundtrip() {
        assert_eq!(wr::unpack(wr::pkt(PktId(17))), wr::Target::Pkt(PktId(17)));
        assert_eq!(wr::unpack(wr::user_rx(RxId(3))), wr::Target::UserRx(RxId(3)));
        assert_eq!(
            wr::unpack(wr::read_rx(RxId(5), 1000)),
            wr::Target::ReadRx(RxId(5), 1000)
        );
        assert_eq!(wr::unpack(wr::read_tx(TxId(9))), wr::Target::ReadTx(TxId(9)));
    }

    #[test]
    #[should_panic(expected = "corrupt work request id")]
    fn test_wr_id_unknown_tag_panics() {
        wr::unpack(0);
    }
}
