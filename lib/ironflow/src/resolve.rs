use crate::peer::Peer;
use crate::transport::SourceId;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use lodestone::logging;
use lodestone::shared::{FaultKind, SizedRead, SizedWrite, XferError, XferResult};

/// Raw fabric-level endpoint name: source identity plus an instance nonce so
/// a restarted endpoint on the same queue pair is distinguishable.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EpName {
    pub slid: u32,
    pub qpn: u32,
    pub nonce: u64,
}

impl EpName {
    pub const SIZE: usize = 16;

    pub fn encode<W: SizedWrite>(&self, stream: &mut W) -> XferResult<()> {
        if stream.free_capacity() < Self::SIZE {
            return Err(XferError::Again);
        }

        stream.write_u32::<BigEndian>(self.slid)?;
        stream.write_u32::<BigEndian>(self.qpn)?;
        stream.write_u64::<BigEndian>(self.nonce)?;
        Ok(())
    }

    pub fn decode<R: SizedRead>(stream: &mut R) -> XferResult<EpName> {
        if stream.remaining_data() < Self::SIZE {
            return Err(XferError::Fault(FaultKind::Truncated));
        }

        Ok(EpName {
            slid: stream.read_u32::<BigEndian>()?,
            qpn: stream.read_u32::<BigEndian>()?,
            nonce: stream.read_u64::<BigEndian>()?,
        })
    }

    #[inline]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let mut stream = std::io::Cursor::new(&mut bytes[..]);
        self.encode(&mut stream).expect("name encode into exact-size buffer");
        bytes
    }

    #[inline]
    pub fn source(&self) -> SourceId {
        SourceId {
            slid: self.slid,
            qpn: self.qpn,
        }
    }

    /// Shared-memory endpoint name derived from the raw name.
    #[inline]
    pub fn shm_name(&self) -> String {
        base64::encode(&self.to_bytes())
    }
}

/// Opaque peer handle: the slot of the peer record in the address vector.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct RemoteAddr(pub u32);

impl From<usize> for RemoteAddr {
    #[inline]
    fn from(id: usize) -> Self {
        RemoteAddr(id as u32)
    }
}

impl Into<usize> for RemoteAddr {
    #[inline]
    fn into(self) -> usize {
        self.0 as usize
    }
}

/// Peer resolution table. Owns the peer records and every reverse index the
/// completion path needs: raw name, NIC source identity and shared-memory
/// name all resolve to the same handle.
pub struct AddressVector {
    peers: Vec<Option<Peer>>,
    free: Vec<u32>,
    by_name: HashMap<[u8; EpName::SIZE], RemoteAddr>,
    by_source: HashMap<SourceId, RemoteAddr>,
    by_shm: HashMap<String, RemoteAddr>,
    log: logging::Logger,
}

impl AddressVector {
    pub fn new(log: logging::Logger) -> AddressVector {
        AddressVector {
            peers: Vec::new(),
            free: Vec::new(),
            by_name: HashMap::new(),
            by_source: HashMap::new(),
            by_shm: HashMap::new(),
            log,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Inserts a peer by raw name, or returns the existing handle. Insertion
    /// is what makes an address submittable; submissions to addresses that
    /// were never inserted fail synchronously.
    pub fn insert(&mut self, name: EpName, node_local: bool) -> RemoteAddr {
        if let Some(&addr) = self.by_name.get(&name.to_bytes()) {
            return addr;
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.peers.push(None);
                (self.peers.len() - 1) as u32
            }
        };

        let addr = RemoteAddr(index);
        let log = self.log.new(logging::o!("peer" => index));
        self.peers[index as usize] = Some(Peer::new(addr, name, node_local, log));

        self.by_name.insert(name.to_bytes(), addr);
        self.by_source.insert(name.source(), addr);
        self.by_shm.insert(name.shm_name(), addr);

        logging::debug!(self.log, "peer inserted";
                        "context" => "av_insert",
                        "peer" => index,
                        "slid" => name.slid,
                        "qpn" => name.qpn,
                        "node_local" => node_local);

        addr
    }

    /// Removes a peer record. The caller is responsible for invalidating any
    /// packets still pointing at it.
    pub fn remove(&mut self, addr: RemoteAddr) -> Option<Peer> {
        let peer = self.peers.get_mut(addr.0 as usize)?.take()?;

        self.by_name.remove(&peer.name.to_bytes());
        self.by_source.remove(&peer.name.source());
        self.by_shm.remove(&peer.name.shm_name());
        self.free.push(addr.0);

        logging::debug!(self.log, "peer removed"; "context" => "av_remove", "peer" => addr.0);

        Some(peer)
    }

    #[inline]
    pub fn contains(&self, addr: RemoteAddr) -> bool {
        self.peers
            .get(addr.0 as usize)
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    #[inline]
    pub fn peer(&self, addr: RemoteAddr) -> Option<&Peer> {
        self.peers.get(addr.0 as usize).and_then(|slot| slot.as_ref())
    }

    #[inline]
    pub fn peer_mut(&mut self, addr: RemoteAddr) -> Option<&mut Peer> {
        self.peers.get_mut(addr.0 as usize).and_then(|slot| slot.as_mut())
    }

    #[inline]
    pub fn of_name(&self, name: &EpName) -> Option<RemoteAddr> {
        self.by_name.get(&name.to_bytes()).copied()
    }

    /// Resolves the NIC-supplied source identity of a receive completion.
    #[inline]
    pub fn of_source(&self, source: SourceId) -> Option<RemoteAddr> {
        self.by_source.get(&source).copied()
    }

    /// Translates a shared-memory name into the endpoint-level handle.
    #[inline]
    pub fn of_shm_name(&self, name: &str) -> Option<RemoteAddr> {
        self.by_shm.get(name).copied()
    }

    /// Snapshot of all live handles. Taken by progress sweeps that mutate
    /// peers while walking.
    pub fn addrs(&self) -> Vec<RemoteAddr> {
        self.peers
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| RemoteAddr(index as u32))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone::logging;

    fn name(slid: u32) -> EpName {
        EpName {
            slid,
            qpn: slid + 100,
            nonce: 7,
        }
    }

    #[test]
    fn test_name_roundtrip() {
        let original = name(3);
        let bytes = original.to_bytes();

        let mut reader = std::io::Cursor::new(&bytes[..]);
        assert_eq!(EpName::decode(&mut reader).unwrap(), original);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut av = AddressVector::new(logging::discard());

        let a = av.insert(name(1), false);
        let b = av.insert(name(1), false);
        assert_eq!(a, b);
        assert_eq!(av.len(), 1);
    }

    #[test]
    fn test_reverse_lookups() {
        let mut av = AddressVector::new(logging::discard());

        let addr = av.insert(name(5), true);

        assert_eq!(av.of_name(&name(5)), Some(addr));
        assert_eq!(av.of_source(name(5).source()), Some(addr));
        assert_eq!(av.of_shm_name(&name(5).shm_name()), Some(addr));
        assert_eq!(av.of_source(name(6).source()), None);
    }

    #[test]
    fn test_remove_clears_indices_and_reuses_slot() {
        let mut av = AddressVector::new(logging::discard());

        let a = av.insert(name(1), false);
        av.remove(a).unwrap();

        assert!(!av.contains(a));
        assert_eq!(av.of_name(&name(1)), None);

        let b = av.insert(name(2), false);
        assert_eq!(a, b);
    }
}
