//! Compute backend collaborator and per-invocation buffer bookkeeping.
//!
//! The [`ComputeBackend`] trait abstracts over the device that runs the
//! batched tilt kernel, so the engine only deals in byte buffers, binding
//! slots and workgroup counts. [`crate::host::HostBackend`] emulates a device
//! on the CPU; `WgpuBackend` (feature `gpu`) runs the WGSL kernel.

use std::fmt;

use crate::config;
use crate::error::{invalid, Result, SsnpError};
use crate::grid::Cutoff;

#[cfg(test)]
mod tests {

    use super::*;
    use crate::host::HostBackend;

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroups(0), 0);
        assert_eq!(workgroups(1), 1);
        assert_eq!(workgroups(256), 1);
        assert_eq!(workgroups(257), 2);
        assert_eq!(workgroups(1000), 4);
    }

    #[test]
    fn scalar_bytes_round_trip() {
        let values = [0.0f32, -1.5, 3.25e-3, f32::MAX];
        assert_eq!(f32_from_bytes(&f32_bytes(&values)).unwrap(), values.to_vec());
        assert!(f32_from_bytes(&[0u8; 6]).is_err());
    }

    #[test]
    fn truncation_flags() {
        for mode in [TruncationMode::Off, TruncationMode::Inclusive, TruncationMode::Exclusive] {
            assert_eq!(TruncationMode::from_flag(mode.flag()).unwrap(), mode);
        }
        assert_eq!(TruncationMode::new(false, Cutoff::Exclusive), TruncationMode::Off);
        assert_eq!(TruncationMode::new(true, Cutoff::Exclusive).flag(), 2);
        assert!(TruncationMode::from_flag(3).is_err());
    }

    #[test]
    fn scope_releases_on_drop() {
        let backend = HostBackend::new();
        {
            let mut scope = BufferScope::new(&backend);
            scope.allocate(&[0u8; 8], BufferUsage::Storage).unwrap();
            scope.allocate(&[0u8; 4], BufferUsage::Uniform).unwrap();
            assert_eq!(backend.live_buffers(), 2);
        }
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn scope_releases_on_failure() {
        let backend = HostBackend::with_capacity(12);
        let outcome = (|| -> Result<()> {
            let mut scope = BufferScope::new(&backend);
            scope.allocate(&[0u8; 8], BufferUsage::ReadOnlyStorage)?;
            scope.allocate(&[0u8; 8], BufferUsage::Storage)?;
            Ok(())
        })();
        assert!(matches!(outcome, Err(SsnpError::ResourceExhausted(_))));
        assert_eq!(backend.live_buffers(), 0);
    }
}

/// How a buffer is bound to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    ReadOnlyStorage,
    Storage,
    Uniform,
}

/// Opaque identifier of a buffer owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(u64);

impl BufferHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Kernels a backend knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    /// One plane-wave amplitude per incidence angle.
    Tilt,
}

impl KernelId {
    pub fn name(&self) -> &'static str {
        match self {
            KernelId::Tilt => "tilt",
        }
    }

    /// Expected usage of each binding slot, in slot order.
    pub fn layout(&self) -> &'static [BufferUsage] {
        match self {
            KernelId::Tilt => &[
                BufferUsage::ReadOnlyStorage, // angles
                BufferUsage::ReadOnlyStorage, // shape
                BufferUsage::ReadOnlyStorage, // resolution
                BufferUsage::Storage,         // output factors
                BufferUsage::Uniform,         // numerical aperture
                BufferUsage::Uniform,         // truncation flag, see TruncationMode
            ],
        }
    }
}

/// Value of the tilt kernel's truncation-flag uniform.
///
/// Snapping onto FFT bins is either off, or on with the NA circle itself
/// inside (`Inclusive`) or outside (`Exclusive`) the accepted set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TruncationMode {
    Off,
    Inclusive,
    Exclusive,
}

impl TruncationMode {
    pub fn new(truncate: bool, cutoff: Cutoff) -> Self {
        match (truncate, cutoff) {
            (false, _) => TruncationMode::Off,
            (true, Cutoff::Inclusive) => TruncationMode::Inclusive,
            (true, Cutoff::Exclusive) => TruncationMode::Exclusive,
        }
    }

    pub fn flag(&self) -> u32 {
        match self {
            TruncationMode::Off => 0,
            TruncationMode::Inclusive => 1,
            TruncationMode::Exclusive => 2,
        }
    }

    pub fn from_flag(flag: u32) -> Result<Self> {
        match flag {
            0 => Ok(TruncationMode::Off),
            1 => Ok(TruncationMode::Inclusive),
            2 => Ok(TruncationMode::Exclusive),
            other => invalid(format!("unknown truncation flag {other}")),
        }
    }
}

/// One binding slot of a dispatch: a byte range of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub slot: u32,
    pub handle: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

impl Binding {
    pub fn whole(slot: u32, handle: BufferHandle, size: u64) -> Self {
        Self {
            slot,
            handle,
            offset: 0,
            size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Host,
    Gpu,
}

/// Describes the capabilities of a compute backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend_type: BackendType,
    pub memory_bytes: Option<usize>,
}

/// Abstraction over the device running batched kernels.
///
/// Every call blocks until the device work it names is complete. Buffers
/// belong to the backend until [`ComputeBackend::release`] is called.
pub trait ComputeBackend: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    /// Uploads `data` into a new device buffer.
    ///
    /// Fails with [`SsnpError::ResourceExhausted`] when the device cannot
    /// hold the buffer.
    fn allocate_buffer(&self, data: &[u8], usage: BufferUsage) -> Result<BufferHandle>;

    /// Runs `kernel` over `workgroups` groups of
    /// [`config::TILT_WORKGROUP_SIZE`] invocations with the given bindings.
    fn dispatch(&self, kernel: KernelId, bindings: &[Binding], workgroups: u32) -> Result<()>;

    /// Copies the full contents of a buffer back to the host.
    fn read_back(&self, handle: BufferHandle) -> Result<Vec<u8>>;

    /// Frees a buffer. Unknown handles are ignored.
    fn release(&self, handle: BufferHandle);
}

/// Buffers acquired for a single kernel invocation.
///
/// Everything allocated through the scope is released when it drops, on the
/// success path and on every early return.
pub struct BufferScope<'a> {
    backend: &'a dyn ComputeBackend,
    handles: Vec<BufferHandle>,
}

impl<'a> BufferScope<'a> {
    pub fn new(backend: &'a dyn ComputeBackend) -> Self {
        Self {
            backend,
            handles: Vec::new(),
        }
    }

    pub fn allocate(&mut self, data: &[u8], usage: BufferUsage) -> Result<BufferHandle> {
        let handle = self.backend.allocate_buffer(data, usage)?;
        self.handles.push(handle);
        Ok(handle)
    }

    pub fn backend(&self) -> &'a dyn ComputeBackend {
        self.backend
    }
}

impl Drop for BufferScope<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.backend.release(handle);
        }
    }
}

/// Number of workgroups covering `count` invocations.
pub fn workgroups(count: usize) -> u32 {
    (count as u32).div_ceil(config::TILT_WORKGROUP_SIZE)
}

pub(crate) fn f32_bytes(values: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub(crate) fn u32_bytes(values: &[u32]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

pub(crate) fn f32_from_bytes(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(SsnpError::NumericalDegeneracy(format!(
            "buffer of {} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

pub(crate) fn u32_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return invalid(format!(
            "buffer of {} bytes is not a whole number of u32 values",
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
