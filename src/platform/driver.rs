//! Vendor driver boundary used by [`DriverPlatform`](super::DriverPlatform).
//!
//! The trait mirrors the primitives every GPU-style API offers in some form:
//! device enumeration, contexts, queues, memory, modules and kernels, and
//! queued copies and launches. Handles and addresses are opaque integers
//! chosen by the driver.

use super::Residency;
use crate::core::DriverError;

/// Opaque driver object handle.
pub type Handle = u64;

/// One device as enumerated by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverDevice {
    pub handle: Handle,
    pub name: String,
    pub total_memory: u64,
}

pub trait DeviceDriver: Send + Sync {
    /// Devices in stable driver order.
    fn enumerate(&self) -> Result<Vec<DriverDevice>, DriverError>;

    fn create_context(&self, device: Handle) -> Result<Handle, DriverError>;

    fn destroy_context(&self, context: Handle) -> Result<(), DriverError>;

    fn create_queue(&self, device: Handle) -> Result<Handle, DriverError>;

    fn destroy_queue(&self, queue: Handle) -> Result<(), DriverError>;

    /// Allocate `size` bytes, returning the address.
    fn mem_alloc(&self, device: Handle, size: usize, residency: Residency)
        -> Result<u64, DriverError>;

    fn mem_free(&self, address: u64) -> Result<(), DriverError>;

    /// Device-side address of a host-visible allocation.
    fn host_to_device_ptr(&self, address: u64) -> Result<u64, DriverError>;

    fn load_module(&self, device: Handle, name: &str) -> Result<Handle, DriverError>;

    fn kernel(&self, module: Handle, name: &str) -> Result<Handle, DriverError>;

    /// Queue a write of `data` to `dst`. The data is copied before returning.
    fn enqueue_write(&self, queue: Handle, dst: u64, data: &[u8]) -> Result<(), DriverError>;

    /// Drain `queue`, then read `out.len()` bytes from `src`.
    fn read(&self, queue: Handle, src: u64, out: &mut [u8]) -> Result<(), DriverError>;

    fn enqueue_copy(&self, queue: Handle, src: u64, dst: u64, size: usize)
        -> Result<(), DriverError>;

    fn enqueue_launch(
        &self,
        queue: Handle,
        kernel: Handle,
        grid: [u32; 3],
        block: [u32; 3],
        args: &[u8],
    ) -> Result<(), DriverError>;

    /// Block until everything queued on `queue` has executed.
    fn wait(&self, queue: Handle) -> Result<(), DriverError>;
}
