// This module defines the uniform device abstraction of hetrt. A Platform is one backend (the
// host CPU, or a vendor driver family such as CUDA, OpenCL, HSA or Vulkan) exposing a fixed set
// of devices addressed by local index. Every platform implements the full capability set:
// allocation in device, host-pinned and unified memory, host/device pointer mapping, release,
// kernel launch, synchronization and copies in all directions. A backend that cannot perform an
// operation returns PlatformError::Unsupported instead of pretending to succeed. Device memory is
// named by opaque DevicePtr values which every platform checks against a per-device allocation
// table, so foreign pointers, double releases, residency mismatches and out-of-range copies are
// reported as errors at the call that commits them. The Runtime registry (crate::runtime) maps a
// flat DeviceId space onto registered platforms and forwards calls with the local index.

//! Device platforms: shared types and the [`Platform`] trait.

pub mod accel;
pub mod cpu;
pub mod device;
pub mod driver;
pub mod reference;

pub use accel::DriverPlatform;
pub use cpu::CpuPlatform;
pub use device::{Allocation, AllocationTable};
pub use driver::{DeviceDriver, DriverDevice, Handle};
pub use reference::{HostKernel, KernelContext, ReferenceDriver};

use crate::core::{PlatformError, PlatformResult};
use std::fmt;

/// Globally unique device id assigned by the runtime registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a device allocation as seen by the owning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Pointer `offset` bytes into the allocation.
    pub fn offset(self, offset: usize) -> DevicePtr {
        DevicePtr(self.0 + offset as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Memory space an allocation lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Device,
    HostPinned,
    Unified,
}

/// Backend family of a platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cpu,
    Cuda,
    OpenCl,
    Hsa,
    Vulkan,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Cpu => "CPU",
            BackendKind::Cuda => "CUDA",
            BackendKind::OpenCl => "OpenCL",
            BackendKind::Hsa => "HSA",
            BackendKind::Vulkan => "Vulkan",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static description of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    /// Bytes of device memory, 0 when the backend does not report it.
    pub total_memory: u64,
    pub backend: BackendKind,
}

/// Signature of kernels the CPU platform can launch.
///
/// Called once per work item with the argument blob and the global work-item
/// coordinates.
pub type CpuKernelFn = unsafe extern "C" fn(args: *const u8, x: u32, y: u32, z: u32);

/// What to run on a device.
#[derive(Debug, Clone)]
pub enum KernelRef {
    /// Host function, e.g. the address of a JIT-compiled `pub fn`.
    Native(CpuKernelFn),
    /// Kernel `name` in a module the driver loads by name.
    Module { module: String, name: String },
}

impl KernelRef {
    pub fn module(module: impl Into<String>, name: impl Into<String>) -> Self {
        KernelRef::Module {
            module: module.into(),
            name: name.into(),
        }
    }
}

/// Packed kernel argument blob.
///
/// Each argument is stored at an offset aligned to its own size, the layout a
/// C struct with the same field sequence would have.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgs {
    bytes: Vec<u8>,
}

impl KernelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_bytes(mut self, data: &[u8]) -> Self {
        let align = data.len().max(1);
        let padded = self.bytes.len().div_ceil(align) * align;
        self.bytes.resize(padded, 0);
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn push_u32(self, value: u32) -> Self {
        self.push_bytes(&value.to_ne_bytes())
    }

    pub fn push_i64(self, value: i64) -> Self {
        self.push_bytes(&value.to_ne_bytes())
    }

    pub fn push_u64(self, value: u64) -> Self {
        self.push_bytes(&value.to_ne_bytes())
    }

    pub fn push_f64(self, value: f64) -> Self {
        self.push_bytes(&value.to_ne_bytes())
    }

    pub fn push_ptr(self, ptr: DevicePtr) -> Self {
        self.push_u64(ptr.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Read back values from an argument blob.
pub fn read_arg_u64(args: &[u8], offset: usize) -> Option<u64> {
    let bytes = args.get(offset..offset + 8)?;
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

pub fn read_arg_u32(args: &[u8], offset: usize) -> Option<u32> {
    let bytes = args.get(offset..offset + 4)?;
    Some(u32::from_ne_bytes(bytes.try_into().ok()?))
}

/// One kernel launch request.
#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub device: DeviceId,
    pub kernel: KernelRef,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    pub args: KernelArgs,
}

impl LaunchParams {
    pub fn new(device: DeviceId, kernel: KernelRef) -> Self {
        Self {
            device,
            kernel,
            grid: [1, 1, 1],
            block: [1, 1, 1],
            args: KernelArgs::new(),
        }
    }

    pub fn grid(mut self, grid: [u32; 3]) -> Self {
        self.grid = grid;
        self
    }

    pub fn block(mut self, block: [u32; 3]) -> Self {
        self.block = block;
        self
    }

    pub fn args(mut self, args: KernelArgs) -> Self {
        self.args = args;
        self
    }

    /// Global work-item extent per dimension.
    ///
    /// Fails when `grid * block` does not fit a `u32` in some dimension.
    pub fn global_size(&self) -> PlatformResult<[u32; 3]> {
        let mut global = [0u32; 3];
        for (dim, extent) in global.iter_mut().enumerate() {
            *extent = self.grid[dim].checked_mul(self.block[dim]).ok_or(
                PlatformError::LaunchExtent {
                    grid: self.grid,
                    block: self.block,
                },
            )?;
        }
        Ok(global)
    }
}

/// A backend's capability set over its local devices.
///
/// Device indices are local to the platform: `0..dev_count()`. Launches and
/// device-to-device copies are asynchronous; `synchronize` waits for them.
/// Host copies wait for previously submitted work on the device before
/// touching the host buffer.
pub trait Platform: Send + Sync {
    /// Human readable backend name.
    fn name(&self) -> &'static str;

    fn dev_count(&self) -> usize;

    fn device_info(&self, dev: usize) -> PlatformResult<DeviceInfo>;

    fn alloc(&self, dev: usize, size: usize) -> PlatformResult<DevicePtr>;

    fn alloc_host(&self, dev: usize, size: usize) -> PlatformResult<DevicePtr>;

    fn alloc_unified(&self, dev: usize, size: usize) -> PlatformResult<DevicePtr>;

    /// Device-visible address of a host-pinned or unified allocation.
    fn get_device_ptr(&self, dev: usize, ptr: DevicePtr) -> PlatformResult<DevicePtr>;

    /// Release a device or unified allocation.
    fn release(&self, dev: usize, ptr: DevicePtr) -> PlatformResult<()>;

    /// Release a host-pinned allocation.
    fn release_host(&self, dev: usize, ptr: DevicePtr) -> PlatformResult<()>;

    fn launch_kernel(&self, dev: usize, params: &LaunchParams) -> PlatformResult<()>;

    fn synchronize(&self, dev: usize) -> PlatformResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn copy(
        &self,
        src_dev: usize,
        src: DevicePtr,
        src_off: usize,
        dst_dev: usize,
        dst: DevicePtr,
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()>;

    fn copy_from_host(
        &self,
        src: &[u8],
        src_off: usize,
        dst_dev: usize,
        dst: DevicePtr,
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()>;

    fn copy_to_host(
        &self,
        src_dev: usize,
        src: DevicePtr,
        src_off: usize,
        dst: &mut [u8],
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()>;
}

/// Report an operation the backend cannot perform.
pub(crate) fn unsupported<T>(platform: &'static str, operation: &'static str) -> PlatformResult<T> {
    log::error!("{}: {} is not supported on this platform", platform, operation);
    Err(PlatformError::Unsupported {
        platform,
        operation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_args_alignment() {
        let args = KernelArgs::new().push_u32(7).push_u64(0xdead).push_u32(1);
        // u32 at 0, u64 padded to 8, u32 at 16
        assert_eq!(args.len(), 20);
        assert_eq!(read_arg_u32(args.as_bytes(), 0), Some(7));
        assert_eq!(read_arg_u64(args.as_bytes(), 8), Some(0xdead));
        assert_eq!(read_arg_u32(args.as_bytes(), 16), Some(1));
        assert_eq!(read_arg_u64(args.as_bytes(), 16), None);
    }

    #[test]
    fn test_launch_params_builder() {
        let params = LaunchParams::new(DeviceId(3), KernelRef::module("m", "k"))
            .grid([2, 1, 1])
            .block([4, 2, 1]);
        assert_eq!(params.global_size(), Ok([8, 2, 1]));
        assert_eq!(params.device, DeviceId(3));
    }

    #[test]
    fn test_global_size_overflow() {
        let params = LaunchParams::new(DeviceId(0), KernelRef::module("m", "k"))
            .grid([1, 65536, 1])
            .block([1, 65536, 1]);
        assert_eq!(
            params.global_size(),
            Err(PlatformError::LaunchExtent {
                grid: [1, 65536, 1],
                block: [1, 65536, 1],
            })
        );
        let params = params.grid([1, u32::MAX, 1]).block([1, 1, 1]);
        assert_eq!(params.global_size(), Ok([1, u32::MAX, 1]));
    }

    #[test]
    fn test_display() {
        assert_eq!(DevicePtr(255).to_string(), "0xff");
        assert_eq!(DeviceId(4).to_string(), "4");
        assert_eq!(BackendKind::OpenCl.to_string(), "OpenCL");
    }
}
