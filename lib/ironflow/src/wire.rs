use crate::resolve::EpName;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lodestone::shared::{FaultKind, SizedRead, SizedWrite, XferError, XferResult};
use std::io::{Read, Write};

/// Fixed header length shared by every packet type. The constant size is what
/// makes the zero-copy receive mode possible.
pub const HDR_SIZE: usize = 40;

// Per-packet flag bits.
pub const F_TAGGED: u8 = 1;
pub const F_CQ_DATA: u8 = 2;
pub const F_DELIVERY_COMPLETE: u8 = 4;
pub const F_SRC_NAME: u8 = 8;
pub const F_REPLY: u8 = 16;
pub const F_FETCH: u8 = 32;

// Protocol features advertised in the handshake.
pub const FEAT_READ: u64 = 1;
pub const FEAT_DELIVERY_COMPLETE: u64 = 2;
pub const FEAT_CONST_HDR: u64 = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PktType {
    Handshake = 0,
    Eager = 1,
    LongReq = 2,
    Cts = 3,
    Data = 4,
    Eor = 5,
    Receipt = 6,
    Write = 7,
    ReadRts = 8,
    Atomic = 9,
    AtomicResp = 10,
}

impl From<PktType> for u8 {
    #[inline]
    fn from(ptype: PktType) -> Self {
        ptype as u8
    }
}

impl PktType {
    #[inline]
    pub fn from_wire(raw: u8) -> XferResult<PktType> {
        Ok(match raw {
            0 => PktType::Handshake,
            1 => PktType::Eager,
            2 => PktType::LongReq,
            3 => PktType::Cts,
            4 => PktType::Data,
            5 => PktType::Eor,
            6 => PktType::Receipt,
            7 => PktType::Write,
            8 => PktType::ReadRts,
            9 => PktType::Atomic,
            10 => PktType::AtomicResp,
            _ => return Err(XferError::Fault(FaultKind::BadPktType)),
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AtomicKind {
    Add = 0,
    Swap = 1,
    Read = 2,
    CompareSwap = 3,
}

impl AtomicKind {
    #[inline]
    pub fn from_wire(raw: u8) -> XferResult<AtomicKind> {
        Ok(match raw {
            0 => AtomicKind::Add,
            1 => AtomicKind::Swap,
            2 => AtomicKind::Read,
            3 => AtomicKind::CompareSwap,
            _ => return Err(XferError::Fault(FaultKind::BadPktType)),
        })
    }
}

/// One header layout for all packet types. Fields that a type does not use
/// are zero on the wire.
///
/// Field meaning by type:
/// - `tx_index`/`rx_index`: sender/receiver entry slots, the compact ids that
///   let a completion or control packet find its entry without a lookup table.
/// - `total_len`: whole-transfer length (REQ-class packets).
/// - `offset`: byte offset of this payload within the transfer, or the remote
///   offset for one-sided packets.
/// - `aux`: tag for tagged messages, remote key for one-sided packets, window
///   grant (bytes) for CTS.
/// - `data`: remote CQ data when `F_CQ_DATA` is set.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PktHeader {
    pub ptype: PktType,
    pub flags: u8,
    pub payload_len: u16,
    pub tx_index: u32,
    pub rx_index: u32,
    pub total_len: u64,
    pub offset: u64,
    pub aux: u64,
    pub data: u64,
}

impl PktHeader {
    #[inline]
    pub fn new(ptype: PktType) -> PktHeader {
        PktHeader {
            ptype,
            flags: 0,
            payload_len: 0,
            tx_index: 0,
            rx_index: 0,
            total_len: 0,
            offset: 0,
            aux: 0,
            data: 0,
        }
    }

    pub fn encode<W: SizedWrite>(&self, stream: &mut W) -> XferResult<()> {
        if stream.free_capacity() < HDR_SIZE {
            return Err(XferError::Again);
        }

        stream.write_u8(self.ptype.into())?;
        stream.write_u8(self.flags)?;
        stream.write_u16::<BigEndian>(self.payload_len)?;
        stream.write_u32::<BigEndian>(self.tx_index)?;
        stream.write_u32::<BigEndian>(self.rx_index)?;
        stream.write_u64::<BigEndian>(self.total_len)?;
        stream.write_u64::<BigEndian>(self.offset)?;
        stream.write_u64::<BigEndian>(self.aux)?;
        stream.write_u64::<BigEndian>(self.data)?;

        Ok(())
    }

    pub fn decode<R: SizedRead>(stream: &mut R) -> XferResult<PktHeader> {
        if stream.remaining_data() < HDR_SIZE {
            return Err(XferError::Fault(FaultKind::Truncated));
        }

        let ptype = PktType::from_wire(stream.read_u8()?)?;
        let flags = stream.read_u8()?;
        let payload_len = stream.read_u16::<BigEndian>()?;
        let tx_index = stream.read_u32::<BigEndian>()?;
        let rx_index = stream.read_u32::<BigEndian>()?;
        let total_len = stream.read_u64::<BigEndian>()?;
        let offset = stream.read_u64::<BigEndian>()?;
        let aux = stream.read_u64::<BigEndian>()?;
        let data = stream.read_u64::<BigEndian>()?;

        let header = PktHeader {
            ptype,
            flags,
            payload_len,
            tx_index,
            rx_index,
            total_len,
            offset,
            aux,
            data,
        };

        if (stream.remaining_data() as u64) < u64::from(payload_len) {
            return Err(XferError::Fault(FaultKind::Truncated));
        }

        Ok(header)
    }

    #[inline]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Handshake payload: the sender's raw endpoint name, its feature mask and
/// its protocol identity. The name is what lets the receiver answer a
/// first-contact packet from a source it has never inserted into its address
/// vector; the protocol and version fields gate incompatible peers out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Handshake {
    pub name: EpName,
    pub version: [u8; 16],
    pub features: u64,
    pub credits: u32,
    pub protocol: u16,
}

impl Handshake {
    pub const SIZE: usize = EpName::SIZE + 30;

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> XferResult<()> {
        if stream.free_capacity() < Self::SIZE {
            return Err(XferError::Again);
        }

        self.name.encode(stream)?;
        stream.write_all(&self.version)?;
        stream.write_u64::<BigEndian>(self.features)?;
        stream.write_u32::<BigEndian>(self.credits)?;
        stream.write_u16::<BigEndian>(self.protocol)?;
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> XferResult<Handshake> {
        if stream.remaining_data() < Self::SIZE {
            return Err(XferError::Fault(FaultKind::Truncated));
        }

        let name = EpName::decode(stream)?;
        let mut version = [0u8; 16];
        stream.read_exact(&mut version)?;

        Ok(Handshake {
            name,
            version,
            features: stream.read_u64::<BigEndian>()?,
            credits: stream.read_u32::<BigEndian>()?,
            protocol: stream.read_u16::<BigEndian>()?,
        })
    }
}

/// Atomic request payload. The operands ride in the payload so the header
/// stays constant-size.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AtomicReq {
    pub kind: AtomicKind,
    pub operand: u64,
    pub compare: u64,
}

impl AtomicReq {
    pub const SIZE: usize = 17;

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> XferResult<()> {
        if stream.free_capacity() < Self::SIZE {
            return Err(XferError::Again);
        }

        stream.write_u8(self.kind as u8)?;
        stream.write_u64::<BigEndian>(self.operand)?;
        stream.write_u64::<BigEndian>(self.compare)?;
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> XferResult<AtomicReq> {
        if stream.remaining_data() < Self::SIZE {
            return Err(XferError::Fault(FaultKind::Truncated));
        }

        Ok(AtomicReq {
            kind: AtomicKind::from_wire(stream.read_u8()?)?,
            operand: stream.read_u64::<BigEndian>()?,
            compare: stream.read_u64::<BigEndian>()?,
        })
    }
}

/// Rendezvous segment table carried by a read RTS: one `(rkey, len)` pair per
/// source segment, read by the receiver in order.
pub fn write_read_table<W: SizedWrite>(segs: &[(u64, u64)], stream: &mut W) -> XferResult<()> {
    if stream.free_capacity() < 2 + segs.len() * 16 {
        return Err(XferError::Again);
    }

    stream.write_u16::<BigEndian>(segs.len() as u16)?;
    for (key, len) in segs {
        stream.write_u64::<BigEndian>(*key)?;
        stream.write_u64::<BigEndian>(*len)?;
    }
    Ok(())
}

pub fn read_read_table<R: SizedRead>(stream: &mut R) -> XferResult<Vec<(u64, u64)>> {
    if stream.remaining_data() < 2 {
        return Err(XferError::Fault(FaultKind::Truncated));
    }

    let count = stream.read_u16::<BigEndian>()? as usize;

    if stream.remaining_data() < count * 16 {
        return Err(XferError::Fault(FaultKind::Truncated));
    }

    let mut segs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = stream.read_u64::<BigEndian>()?;
        let len = stream.read_u64::<BigEndian>()?;
        segs.push((key, len));
    }
    Ok(segs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_roundtrip() {
        let mut header = PktHeader::new(PktType::Data);
        header.flags = F_TAGGED | F_CQ_DATA;
        header.payload_len = 512;
        header.tx_index = 7;
        header.rx_index = 9;
        header.total_len = 1 << 20;
        header.offset = 8192;
        header.aux = 0xdead_beef;
        header.data = 42;

        let mut buf = [0u8; HDR_SIZE + 512];
        let mut writer = Cursor::new(&mut buf[..]);
        header.encode(&mut writer).unwrap();
        assert_eq!(writer.position() as usize, HDR_SIZE);

        let mut reader = Cursor::new(&buf[..]);
        let decoded = PktHeader::decode(&mut reader).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_unknown_type() {
        let mut buf = [0u8; HDR_SIZE];
        buf[0] = 99;

        let mut reader = Cursor::new(&buf[..]);
        let result = PktHeader::decode(&mut reader);
        assert_eq!(result.unwrap_err(), XferError::Fault(FaultKind::BadPktType));
    }

    #[test]
    fn test_header_rejects_truncated_payload() {
        let mut header = PktHeader::new(PktType::Eager);
        header.payload_len = 100;

        let mut buf = [0u8; HDR_SIZE + 50];
        let mut writer = Cursor::new(&mut buf[..]);
        header.encode(&mut writer).unwrap();

        let mut reader = Cursor::new(&buf[..]);
        let result = PktHeader::decode(&mut reader);
        assert_eq!(result.unwrap_err(), XferError::Fault(FaultKind::Truncated));
    }

    #[test]
    fn test_header_rejects_short_frame() {
        let buf = [0u8; HDR_SIZE - 1];
        let mut reader = Cursor::new(&buf[..]);
        let result = PktHeader::decode(&mut reader);
        assert_eq!(result.unwrap_err(), XferError::Fault(FaultKind::Truncated));
    }

    #[test]
    fn test_handshake_roundtrip() {
        let handshake = Handshake {
            name: EpName {
                slid: 12,
                qpn: 34,
                nonce: 0x1122_3344_5566_7788,
            },
            version: lodestone::VERSION_ID,
            features: FEAT_READ | FEAT_DELIVERY_COMPLETE,
            credits: 64,
            protocol: lodestone::PROTOCOL_ID,
        };

        let mut buf = [0u8; Handshake::SIZE];
        let mut writer = Cursor::new(&mut buf[..]);
        handshake.write(&mut writer).unwrap();

        let mut reader = Cursor::new(&buf[..]);
        assert_eq!(Handshake::read(&mut reader).unwrap(), handshake);
    }

    #[test]
    fn test_atomic_req_roundtrip() {
        let req = AtomicReq {
            kind: AtomicKind::CompareSwap,
            operand: 10,
            compare: 20,
        };

        let mut buf = [0u8; AtomicReq::SIZE];
        let mut writer = Cursor::new(&mut buf[..]);
        req.write(&mut writer).unwrap();

        let mut reader = Cursor::new(&buf[..]);
        assert_eq!(AtomicReq::read(&mut reader).unwrap(), req);
    }

    #[test]
    fn test_read_table_roundtrip() {
        let segs = vec![(1u64, 4096u64), (2, 8192), (3, 16)];

        let mut buf = [0u8; 128];
        let mut writer = Cursor::new(&mut buf[..]);
        write_read_table(&segs, &mut writer).unwrap();

        let mut reader = Cursor::new(&buf[..]);
        assert_eq!(read_read_table(&mut reader).unwrap(), segs);
    }

    #[test]
    fn test_read_table_rejects_truncation() {
        let mut buf = [0u8; 10];
        let mut writer = Cursor::new(&mut buf[..]);
        writer.write_u16::<BigEndian>(4).unwrap();

        let mut reader = Cursor::new(&buf[..]);
        let result = read_read_table(&mut reader);
        assert_eq!(result.unwrap_err(), XferError::Fault(FaultKind::Truncated));
    }
}
