//! CPU emulation of a compute device.
//!
//! Buffers live in host memory as plain byte vectors and kernels run in
//! `f32`, invocation by invocation, mirroring `shaders/tilt.wgsl` so that the
//! accelerated path can be exercised without a GPU. Invocations are spread
//! over the rayon pool; each writes only its own output slots.

use std::collections::HashMap;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rayon::prelude::*;
use tracing::debug;

use crate::backend::{
    f32_bytes, f32_from_bytes, u32_from_bytes, BackendType, Binding, BufferHandle, BufferUsage,
    ComputeBackend, DeviceInfo, KernelId, TruncationMode,
};
use crate::config;
use crate::error::{invalid, Result, SsnpError};


struct HostBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
}

/// Device emulated in host memory.
pub struct HostBackend {
    buffers: Mutex<HashMap<u64, HostBuffer>>,
    next_id: AtomicU64,
    capacity: Option<usize>,
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: None,
        }
    }

    /// A backend that refuses allocations beyond `bytes` in total.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::new()
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.buffers
            .lock()
            .map(|table| table.values().map(|b| b.data.len()).sum())
            .unwrap_or(0)
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.lock().map(|table| table.len()).unwrap_or(0)
    }

    fn table(&self) -> Result<MutexGuard<'_, HashMap<u64, HostBuffer>>> {
        self.buffers
            .lock()
            .map_err(|_| SsnpError::ResourceExhausted("host buffer table is poisoned".into()))
    }
}

/// Byte range of one binding, checked against the buffer and the slot layout.
fn bound<'t>(
    table: &'t HashMap<u64, HostBuffer>,
    binding: &Binding,
    usage: BufferUsage,
) -> Result<&'t [u8]> {
    let buffer = table
        .get(&binding.handle.id())
        .ok_or_else(|| SsnpError::InvalidArgument(format!("unknown {}", binding.handle)))?;
    if buffer.usage != usage {
        return invalid(format!(
            "slot {} expects {:?}, {} was allocated as {:?}",
            binding.slot, usage, binding.handle, buffer.usage
        ));
    }
    let start = binding.offset as usize;
    match start.checked_add(binding.size as usize) {
        Some(end) if end <= buffer.data.len() => Ok(&buffer.data[start..end]),
        _ => invalid(format!(
            "slot {} range of {} bytes at offset {} exceeds {} of {} bytes",
            binding.slot,
            binding.size,
            binding.offset,
            binding.handle,
            buffer.data.len()
        )),
    }
}

/// `m·(n/2) mod n` over `n`, the centre phase of integer bin `m`.
fn bin_cycles(m: f32, n: u32) -> f32 {
    let n = n as i64;
    (m as i64 * (n / 2)).rem_euclid(n) as f32 / n as f32
}

/// One invocation of the tilt kernel, in the kernel's own precision.
///
/// `res` is in units of the medium wavelength and `na` is divided by the
/// reference index. Returns `(re, im)` of the amplitude, or zeros for a null
/// angle.
pub(crate) fn tilt_invocation(
    angle: [f32; 2],
    shape: [u32; 2],
    res: [f32; 3],
    na: f32,
    mode: TruncationMode,
) -> [f32; 2] {
    let [polar, azimuth] = angle;
    let [h, w] = shape;
    let (rx, ry) = (res[0], res[1]);

    let ca = polar.sin() * azimuth.cos();
    let cb = polar.sin() * azimuth.sin();

    let cycles = if mode == TruncationMode::Off {
        ca * (w / 2) as f32 * rx + cb * (h / 2) as f32 * ry
    } else {
        let mx = (ca * w as f32 * rx).trunc();
        let my = (cb * h as f32 * ry).trunc();
        if mx.abs() > (w / 2) as f32 || my.abs() > (h / 2) as f32 {
            return [0.0, 0.0];
        }
        let sa = mx / (w as f32 * rx);
        let sb = my / (h as f32 * ry);
        let radial = sa * sa + sb * sb;
        let outside = match mode {
            TruncationMode::Exclusive => radial >= na * na,
            _ => radial > na * na,
        };
        if outside {
            return [0.0, 0.0];
        }
        bin_cycles(mx, w) + bin_cycles(my, h)
    };

    let phase = TAU * (cycles - cycles.floor());
    [phase.cos(), -phase.sin()]
}

impl HostBackend {
    fn run_tilt(&self, table: &mut HashMap<u64, HostBuffer>, bindings: &[Binding], workgroups: u32) -> Result<()> {
        let layout = KernelId::Tilt.layout();
        if bindings.len() != layout.len() {
            return invalid(format!(
                "tilt kernel takes {} bindings, got {}",
                layout.len(),
                bindings.len()
            ));
        }
        for (expected, binding) in bindings.iter().enumerate() {
            if binding.slot as usize != expected {
                return invalid(format!(
                    "binding {} is bound to slot {}",
                    expected, binding.slot
                ));
            }
            bound(table, binding, layout[expected])?;
        }

        let angles = f32_from_bytes(bound(table, &bindings[0], layout[0])?)?;
        let shape = u32_from_bytes(bound(table, &bindings[1], layout[1])?)?;
        let res = f32_from_bytes(bound(table, &bindings[2], layout[2])?)?;
        let output_len = bindings[3].size as usize / 4;
        let na = f32_from_bytes(bound(table, &bindings[4], layout[4])?)?;
        let flag = u32_from_bytes(bound(table, &bindings[5], layout[5])?)?;

        let (shape, res, na, flag) = match (shape.as_slice(), res.as_slice(), na.first(), flag.first()) {
            ([h, w, ..], [rx, ry, rz, ..], Some(&na), Some(&flag)) => ([*h, *w], [*rx, *ry, *rz], na, flag),
            _ => return invalid("tilt kernel inputs are truncated"),
        };
        let mode = TruncationMode::from_flag(flag)?;

        // the kernel guards with arrayLength(output) / 2
        let count = output_len / 2;
        let invocations = (workgroups as usize * config::TILT_WORKGROUP_SIZE as usize).min(count);
        if angles.len() < 2 * invocations {
            return invalid(format!(
                "{} angle values cannot feed {} invocations",
                angles.len(),
                invocations
            ));
        }

        let mut factors = vec![0.0f32; 2 * invocations];
        factors
            .par_chunks_exact_mut(2)
            .enumerate()
            .for_each(|(idx, slot)| {
                let out = tilt_invocation([angles[2 * idx], angles[2 * idx + 1]], shape, res, na, mode);
                slot.copy_from_slice(&out);
            });

        let output = table
            .get_mut(&bindings[3].handle.id())
            .ok_or_else(|| SsnpError::InvalidArgument(format!("unknown {}", bindings[3].handle)))?;
        let start = bindings[3].offset as usize;
        let bytes = f32_bytes(&factors);
        output.data[start..start + bytes.len()].copy_from_slice(&bytes);

        debug!(invocations, workgroups, "host tilt kernel complete");
        Ok(())
    }
}

impl ComputeBackend for HostBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "host emulation".into(),
            backend_type: BackendType::Host,
            memory_bytes: self.capacity,
        }
    }

    fn allocate_buffer(&self, data: &[u8], usage: BufferUsage) -> Result<BufferHandle> {
        let mut table = self.table()?;
        if let Some(capacity) = self.capacity {
            let used: usize = table.values().map(|b| b.data.len()).sum();
            if used + data.len() > capacity {
                return Err(SsnpError::ResourceExhausted(format!(
                    "requested {} bytes with {} of {} in use",
                    data.len(),
                    used,
                    capacity
                )));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        table.insert(
            id,
            HostBuffer {
                data: data.to_vec(),
                usage,
            },
        );
        Ok(BufferHandle::new(id))
    }

    fn dispatch(&self, kernel: KernelId, bindings: &[Binding], workgroups: u32) -> Result<()> {
        let mut table = self.table()?;
        match kernel {
            KernelId::Tilt => self.run_tilt(&mut table, bindings, workgroups),
        }
    }

    fn read_back(&self, handle: BufferHandle) -> Result<Vec<u8>> {
        let table = self.table()?;
        table
            .get(&handle.id())
            .map(|b| b.data.clone())
            .ok_or_else(|| SsnpError::InvalidArgument(format!("unknown {handle}")))
    }

    fn release(&self, handle: BufferHandle) {
        if let Ok(mut table) = self.buffers.lock() {
            table.remove(&handle.id());
        }
    }
}
