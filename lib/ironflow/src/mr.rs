use crate::wire::AtomicKind;
use lodestone::shared::XferResult;

pub const ACCESS_LOCAL: u8 = 1;
pub const ACCESS_REMOTE: u8 = 2;

/// Opaque registration handle returned by the registrar.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct MrHandle(pub u64);

/// Opaque per-transport descriptor derived from a registration, passed down
/// to the fabric on every post that touches the registered region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct MrDesc(pub u64);

/// Registration boundary towards the fabric.
///
/// Registered bytes become addressable by one-sided operations under the
/// handle's remote key. The target-side calls resolve keys for the emulated
/// one-sided paths (incoming writes and atomics are applied by the receiving
/// endpoint, not by the NIC).
pub trait MemoryRegistrar {
    fn register(&mut self, bytes: &[u8], access: u8) -> XferResult<MrHandle>;

    fn release(&mut self, handle: MrHandle);

    fn descriptor(&self, handle: MrHandle) -> MrDesc;

    /// Shared-memory view of the same registration.
    fn shm_descriptor(&self, handle: MrHandle) -> MrDesc;

    /// Remote key under which one-sided peers address this registration.
    fn rkey(&self, handle: MrHandle) -> u64;

    fn write_target(&mut self, key: u64, offset: u64, src: &[u8]) -> XferResult<()>;

    fn read_target(&self, key: u64, offset: u64, dst: &mut [u8]) -> XferResult<usize>;

    /// Applies an atomic op to a registered u64 lane and returns the prior
    /// value.
    fn atomic_target(
        &mut self,
        key: u64,
        offset: u64,
        kind: AtomicKind,
        operand: u64,
        compare: u64,
    ) -> XferResult<u64>;
}
