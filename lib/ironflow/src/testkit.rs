//! In-process mock fabric for exercising the endpoint without hardware:
//! paired transports with posted-receive accounting, injectable RNR and
//! EAGAIN, a loopback read-target store and a bookkeeping registrar.

use crate::mr::{MemoryRegistrar, MrDesc, MrHandle};
use crate::resolve::EpName;
use crate::transport::{CqEntry, CqErr, CqOp, SourceId, Transport};
use crate::wire::AtomicKind;
use hashbrown::{HashMap, HashSet};
use lodestone::shared::{FaultKind, XferError, XferResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Default)]
struct Node {
    posted_recvs: VecDeque<(u64, usize)>,
    cq: VecDeque<CqEntry>,
    err: VecDeque<CqErr>,
    /// Next `force_rnr` inbound frames bounce with receiver-not-ready.
    force_rnr: u32,
    /// Next `eagain_sends` posts are refused with transient back-pressure.
    eagain_sends: u32,
}

#[derive(Default)]
struct FabricState {
    nodes: HashMap<SourceId, Node>,
}

/// One emulated fabric. NIC and shared-memory lanes use separate instances
/// so their address spaces stay disjoint.
#[derive(Clone)]
pub struct Fabric {
    state: Rc<RefCell<FabricState>>,
    targets: Rc<RefCell<TargetStore>>,
}

#[derive(Default)]
struct TargetStore {
    regions: HashMap<u64, Vec<u8>>,
    next_key: u64,
}

impl Fabric {
    pub fn new() -> Fabric {
        Fabric {
            state: Rc::new(RefCell::new(FabricState::default())),
            targets: Rc::new(RefCell::new(TargetStore::default())),
        }
    }

    /// Bounce the next `count` frames arriving at `dest` with RNR.
    pub fn force_rnr(&self, dest: SourceId, count: u32) {
        self.state.borrow_mut().nodes.entry(dest).or_default().force_rnr = count;
    }

    /// Refuse the next `count` posts from `source` with EAGAIN.
    pub fn force_eagain(&self, source: SourceId, count: u32) {
        self.state.borrow_mut().nodes.entry(source).or_default().eagain_sends = count;
    }

    pub fn posted_recvs(&self, node: SourceId) -> usize {
        self.state
            .borrow_mut()
            .nodes
            .entry(node)
            .or_default()
            .posted_recvs
            .len()
    }

    /// A registrar view sharing this fabric's read-target space.
    pub fn registrar(&self) -> MockRegistrar {
        MockRegistrar {
            targets: self.targets.clone(),
            mine: HashSet::new(),
            fail_register: false,
        }
    }
}

pub struct MockTransport {
    fabric: Fabric,
    me: EpName,
    mtu: usize,
    max_outstanding: usize,
    read: bool,
    staged: Vec<(SourceId, Vec<u8>, u64)>,
}

impl MockTransport {
    pub fn new(fabric: &Fabric, me: EpName, supports_read: bool) -> MockTransport {
        MockTransport {
            fabric: fabric.clone(),
            me,
            mtu: 8256,
            max_outstanding: 64,
            read: supports_read,
            staged: Vec::new(),
        }
    }

    pub fn with_max_outstanding(mut self, max_outstanding: usize) -> MockTransport {
        self.max_outstanding = max_outstanding;
        self
    }

    fn deliver_staged(&mut self) {
        let mut state = self.fabric.state.borrow_mut();

        for (dest, frame, wr_id) in self.staged.drain(..) {
            let me = self.me.source();
            let len = frame.len();

            let node = state.nodes.entry(dest).or_default();
            let accepted = if node.force_rnr > 0 {
                node.force_rnr -= 1;
                false
            } else {
                match node.posted_recvs.pop_front() {
                    Some((recv_wr, _cap)) => {
                        node.cq.push_back(CqEntry {
                            wr_id: recv_wr,
                            op: CqOp::Recv,
                            len,
                            src: Some(me),
                            bytes: frame,
                        });
                        true
                    }
                    None => false,
                }
            };

            let sender = state.nodes.entry(me).or_default();
            match accepted {
                true => sender.cq.push_back(CqEntry {
                    wr_id,
                    op: CqOp::Send,
                    len,
                    src: None,
                    bytes: Vec::new(),
                }),
                false => sender.err.push_back(CqErr {
                    wr_id,
                    op: CqOp::Send,
                    rnr: true,
                    code: 0,
                }),
            }
        }
    }
}

impl Transport for MockTransport {
    fn enable(&mut self) -> XferResult<EpName> {
        self.fabric
            .state
            .borrow_mut()
            .nodes
            .entry(self.me.source())
            .or_default();
        Ok(self.me)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    fn supports_read(&self) -> bool {
        self.read
    }

    fn post_send(
        &mut self,
        dest: SourceId,
        frame: &[u8],
        _desc: Option<MrDesc>,
        wr_id: u64,
        more: bool,
    ) -> XferResult<()> {
        {
            let mut state = self.fabric.state.borrow_mut();
            let node = state.nodes.entry(self.me.source()).or_default();
            if node.eagain_sends > 0 {
                node.eagain_sends -= 1;
                return Err(XferError::Again);
            }
        }

        self.staged.push((dest, frame.to_vec(), wr_id));
        if !more {
            self.deliver_staged();
        }
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64, capacity: usize, _more: bool) -> XferResult<()> {
        self.fabric
            .state
            .borrow_mut()
            .nodes
            .entry(self.me.source())
            .or_default()
            .posted_recvs
            .push_back((wr_id, capacity));
        Ok(())
    }

    fn post_read(
        &mut self,
        _dest: SourceId,
        key: u64,
        offset: u64,
        len: usize,
        _desc: Option<MrDesc>,
        wr_id: u64,
    ) -> XferResult<()> {
        let bytes = {
            let targets = self.fabric.targets.borrow();
            targets.regions.get(&key).and_then(|region| {
                let offset = offset as usize;
                region.get(offset..offset + len).map(<[u8]>::to_vec)
            })
        };

        let mut state = self.fabric.state.borrow_mut();
        let node = state.nodes.entry(self.me.source()).or_default();

        match bytes {
            Some(bytes) => {
                node.cq.push_back(CqEntry {
                    wr_id,
                    op: CqOp::Read,
                    len,
                    src: None,
                    bytes,
                });
                Ok(())
            }
            None => {
                node.err.push_back(CqErr {
                    wr_id,
                    op: CqOp::Read,
                    rnr: false,
                    code: -14,
                });
                Ok(())
            }
        }
    }

    fn drain_cq(&mut self, out: &mut Vec<CqEntry>, max: usize) -> usize {
        let mut state = self.fabric.state.borrow_mut();
        let node = state.nodes.entry(self.me.source()).or_default();

        let count = max.min(node.cq.len());
        out.extend(node.cq.drain(..count));
        count
    }

    fn drain_err(&mut self, out: &mut Vec<CqErr>, max: usize) -> usize {
        let mut state = self.fabric.state.borrow_mut();
        let node = state.nodes.entry(self.me.source()).or_default();

        let count = max.min(node.err.len());
        out.extend(node.err.drain(..count));
        count
    }

    fn flush(&mut self) {
        self.deliver_staged();
    }

    fn shutdown(&mut self) {
        self.staged.clear();
    }
}

pub struct MockRegistrar {
    targets: Rc<RefCell<TargetStore>>,
    mine: HashSet<u64>,
    fail_register: bool,
}

impl MockRegistrar {
    /// A registrar with a private target space, for pool-level tests.
    pub fn new() -> MockRegistrar {
        MockRegistrar {
            targets: Rc::new(RefCell::new(TargetStore::default())),
            mine: HashSet::new(),
            fail_register: false,
        }
    }

    pub fn fail_next_registrations(&mut self, fail: bool) {
        self.fail_register = fail;
    }

    pub fn registered_count(&self) -> usize {
        self.mine.len()
    }

    /// Registers an application target region and returns its remote key.
    pub fn expose(&mut self, bytes: &[u8]) -> u64 {
        let handle = self.register(bytes, crate::mr::ACCESS_REMOTE).expect("mock register");
        self.rkey(handle)
    }

    /// Reads back an exposed region, e.g. to observe one-sided writes.
    pub fn snapshot(&self, key: u64) -> Option<Vec<u8>> {
        self.targets.borrow().regions.get(&key).cloned()
    }
}

impl MemoryRegistrar for MockRegistrar {
    fn register(&mut self, bytes: &[u8], _access: u8) -> XferResult<MrHandle> {
        if self.fail_register {
            return Err(XferError::Fault(FaultKind::Registration));
        }

        let mut targets = self.targets.borrow_mut();
        targets.next_key += 1;
        let key = targets.next_key;
        targets.regions.insert(key, bytes.to_vec());
        self.mine.insert(key);
        Ok(MrHandle(key))
    }

    fn release(&mut self, handle: MrHandle) {
        self.mine.remove(&handle.0);
        self.targets.borrow_mut().regions.remove(&handle.0);
    }

    fn descriptor(&self, handle: MrHandle) -> MrDesc {
        MrDesc(handle.0)
    }

    fn shm_descriptor(&self, handle: MrHandle) -> MrDesc {
        MrDesc(handle.0 | 1 << 63)
    }

    fn rkey(&self, handle: MrHandle) -> u64 {
        handle.0
    }

    fn write_target(&mut self, key: u64, offset: u64, src: &[u8]) -> XferResult<()> {
        let mut targets = self.targets.borrow_mut();
        let region = targets
            .regions
            .get_mut(&key)
            .ok_or(XferError::Fault(FaultKind::UnknownKey))?;

        let offset = offset as usize;
        if offset + src.len() > region.len() {
            return Err(XferError::Fault(FaultKind::TooLong));
        }

        region[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn read_target(&self, key: u64, offset: u64, dst: &mut [u8]) -> XferResult<usize> {
        let targets = self.targets.borrow();
        let region = targets
            .regions
            .get(&key)
            .ok_or(XferError::Fault(FaultKind::UnknownKey))?;

        let offset = offset as usize;
        let count = dst.len().min(region.len().saturating_sub(offset));
        dst[..count].copy_from_slice(&region[offset..offset + count]);
        Ok(count)
    }

    fn atomic_target(
        &mut self,
        key: u64,
        offset: u64,
        kind: AtomicKind,
        operand: u64,
        compare: u64,
    ) -> XferResult<u64> {
        let mut targets = self.targets.borrow_mut();
        let region = targets
            .regions
            .get_mut(&key)
            .ok_or(XferError::Fault(FaultKind::UnknownKey))?;

        let offset = offset as usize;
        if offset + 8 > region.len() {
            return Err(XferError::Fault(FaultKind::TooLong));
        }

        let mut lane = [0u8; 8];
        lane.copy_from_slice(&region[offset..offset + 8]);
        let old = u64::from_le_bytes(lane);

        let new = match kind {
            AtomicKind::Add => old.wrapping_add(operand),
            AtomicKind::Swap => operand,
            AtomicKind::Read => old,
            AtomicKind::CompareSwap => match old == compare {
                true => operand,
                false => old,
            },
        };

        region[offset..offset + 8].copy_from_slice(&new.to_le_bytes());
        Ok(old)
    }
}

pub mod harness {
    use super::{Fabric, MockRegistrar, MockTransport};
    use crate::config::EndpointConfig;
    use crate::endpoint::Endpoint;
    use crate::resolve::{AddressVector, EpName, RemoteAddr};
    use lodestone::logging;

    pub struct HarnessOpts {
        pub cfg: EndpointConfig,
        pub shm: bool,
        pub supports_read: bool,
        pub max_outstanding: usize,
    }

    impl Default for HarnessOpts {
        fn default() -> HarnessOpts {
            HarnessOpts {
                cfg: EndpointConfig::default(),
                shm: false,
                supports_read: true,
                max_outstanding: 64,
            }
        }
    }

    pub struct FabricHandle {
        pub nic: Fabric,
        pub shm: Fabric,
        pub a_name: EpName,
        pub b_name: EpName,
    }

    impl FabricHandle {
        /// Registrar view on the NIC fabric's target space, for exposing
        /// application regions to one-sided operations.
        pub fn registrar(&self) -> MockRegistrar {
            self.nic.registrar()
        }
    }

    pub fn name(id: u32) -> EpName {
        EpName {
            slid: id,
            qpn: id + 1000,
            nonce: u64::from(id) << 32,
        }
    }

    fn build(opts: &HarnessOpts, fabrics: &FabricHandle, me: EpName) -> Endpoint {
        let nic = Box::new(
            MockTransport::new(&fabrics.nic, me, opts.supports_read)
                .with_max_outstanding(opts.max_outstanding),
        );
        let shm: Option<Box<dyn crate::transport::Transport>> = match opts.shm {
            true => Some(Box::new(MockTransport::new(&fabrics.shm, me, false))),
            false => None,
        };

        let endpoint = Endpoint::new(
            opts.cfg.clone(),
            nic,
            shm,
            Box::new(fabrics.nic.registrar()),
            logging::discard(),
        )
        .expect("endpoint construction");

        endpoint.bind_av(AddressVector::new(logging::discard()));
        endpoint.enable().expect("endpoint enable");
        endpoint
    }

    /// Two enabled endpoints wired to the same mock fabrics, mutually
    /// inserted. Returns (a, b, a's address on b, b's address on a, fabrics).
    pub fn pair(opts: HarnessOpts) -> (Endpoint, Endpoint, RemoteAddr, RemoteAddr, FabricHandle) {
        let fabrics = FabricHandle {
            nic: Fabric::new(),
            shm: Fabric::new(),
            a_name: name(1),
            b_name: name(2),
        };

        let a = build(&opts, &fabrics, fabrics.a_name);
        let b = build(&opts, &fabrics, fabrics.b_name);

        let node_local = opts.shm;
        let a_on_b = b.av_insert(fabrics.a_name, node_local).expect("insert");
        let b_on_a = a.av_insert(fabrics.b_name, node_local).expect("insert");

        // Prime both receive rings so first-contact sends find buffers.
        a.progress();
        b.progress();

        (a, b, a_on_b, b_on_a, fabrics)
    }

    /// Alternates progress on both endpoints.
    pub fn drain_one(a: &crate::endpoint::Endpoint, b: &crate::endpoint::Endpoint, ticks: usize) {
        for _ in 0..ticks {
            a.progress();
            b.progress();
        }
    }
}
