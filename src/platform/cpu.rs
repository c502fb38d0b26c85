// This module implements the host CPU platform. Each CPU "device" is a worker thread fed by an
// mpsc channel: launches and device-to-device copies are sent as commands and executed in FIFO
// order, which gives the same-device ordering guarantee every platform promises, and
// synchronize posts a fence and waits until the worker reaches it. Memory is plain host memory
// from the global allocator (64-byte aligned, zero initialised), so device, host-pinned and
// unified allocations differ only in the residency recorded for them and get_device_ptr is
// the identity. Kernels are native extern "C" functions, typically JIT-compiled exports.
// Every host-side access to allocation memory happens while the owning device's allocation
// table is locked, and release drains the queue under that same lock, so a concurrent release
// can never free memory between the range check and the access.

//! Host CPU platform with one worker thread per device.

use super::device::{check_bounds, local, AllocationTable, Device};
use super::{
    BackendKind, CpuKernelFn, DeviceInfo, DevicePtr, KernelArgs, KernelRef, LaunchParams,
    Platform, Residency,
};
use crate::core::{DriverError, PlatformError, PlatformResult};
use parking_lot::{Mutex, MutexGuard};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::mpsc;
use std::thread::JoinHandle;

const NAME: &str = "CPU";
const ALIGN: usize = 64;

/// Environment variable read by [`CpuPlatform::from_env`].
pub const CPU_DEVICES_ENV: &str = "HETRT_CPU_DEVICES";

enum Command {
    Launch {
        kernel: CpuKernelFn,
        args: KernelArgs,
        global: [u32; 3],
    },
    Copy {
        src: u64,
        dst: u64,
        size: usize,
    },
    Fence(mpsc::Sender<()>),
}

struct Worker {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn spawn(index: usize) -> PlatformResult<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let thread = std::thread::Builder::new()
            .name(format!("hetrt-cpu-{}", index))
            .spawn(move || run_worker(index, receiver))
            .map_err(|e| DriverError::Backend(format!("failed to spawn worker thread: {}", e)))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }

    fn send(&self, device: usize, command: Command) -> PlatformResult<()> {
        let sender = self.sender.lock();
        sender
            .as_ref()
            .and_then(|s| s.send(command).ok())
            .ok_or(PlatformError::QueueDisconnected { device })
    }

    fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                log::error!("CPU worker thread panicked");
            }
        }
    }
}

fn run_worker(index: usize, receiver: mpsc::Receiver<Command>) {
    log::debug!("CPU device {}: worker started", index);
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Launch {
                kernel,
                args,
                global,
            } => {
                log::trace!("CPU device {}: launch over {:?}", index, global);
                for z in 0..global[2] {
                    for y in 0..global[1] {
                        for x in 0..global[0] {
                            // SAFETY: the launcher guarantees the kernel matches
                            // `CpuKernelFn` and that its arguments stay valid.
                            unsafe { kernel(args.as_bytes().as_ptr(), x, y, z) };
                        }
                    }
                }
            }
            Command::Copy { src, dst, size } => {
                // SAFETY: both ranges were checked against live allocations and
                // releases drain this queue before freeing.
                unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, size) };
            }
            Command::Fence(done) => {
                let _ = done.send(());
            }
        }
    }
    log::debug!("CPU device {}: worker stopped", index);
}

/// Host platform exposing `n` worker-thread devices.
pub struct CpuPlatform {
    devices: Vec<Device<Worker>>,
}

impl CpuPlatform {
    pub fn new(devices: usize) -> PlatformResult<Self> {
        let devices = (0..devices)
            .map(|index| {
                let info = DeviceInfo {
                    name: format!("CPU worker {}", index),
                    total_memory: 0,
                    backend: BackendKind::Cpu,
                };
                Ok(Device::new(index, info, Worker::spawn(index)?))
            })
            .collect::<PlatformResult<Vec<_>>>()?;

        log::info!("CPU platform initialized with {} device(s)", devices.len());
        Ok(Self { devices })
    }

    /// Device count from `HETRT_CPU_DEVICES`, defaulting to one.
    pub fn from_env() -> PlatformResult<Self> {
        let count = std::env::var(CPU_DEVICES_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(1);
        Self::new(count)
    }

    fn device(&self, dev: usize) -> PlatformResult<&Device<Worker>> {
        local(&self.devices, NAME, dev)
    }

    fn layout(size: usize) -> PlatformResult<Layout> {
        Layout::from_size_align(size.max(1), ALIGN)
            .map_err(|_| DriverError::OutOfMemory { size }.into())
    }

    fn allocate(&self, dev: usize, size: usize, residency: Residency) -> PlatformResult<DevicePtr> {
        let device = self.device(dev)?;
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        if raw.is_null() {
            return Err(DriverError::OutOfMemory { size }.into());
        }

        let ptr = DevicePtr(raw as u64);
        device.allocations().insert(ptr, size, residency);
        log::trace!("CPU device {}: {:?} alloc {} bytes at {}", dev, residency, size, ptr);
        Ok(ptr)
    }

    fn free(
        &self,
        dev: usize,
        ptr: DevicePtr,
        accepted: &[Residency],
        expected: &'static str,
    ) -> PlatformResult<()> {
        let device = self.device(dev)?;
        let mut table = device.allocations();
        // In-flight work may still touch the allocation.
        self.synchronize(dev)?;
        let allocation = table.remove(dev, ptr, accepted, expected)?;
        let layout = Self::layout(allocation.size)?;
        // SAFETY: allocated by `allocate` with the same layout and removed from
        // the table exactly once.
        unsafe { dealloc(ptr.0 as *mut u8, layout) };
        Ok(())
    }

    /// Allocation tables of `a` and `b`, locked in index order.
    ///
    /// The second guard is `None` when both name the same device.
    fn lock_pair(
        &self,
        a: usize,
        b: usize,
    ) -> PlatformResult<(
        MutexGuard<'_, AllocationTable>,
        Option<MutexGuard<'_, AllocationTable>>,
    )> {
        let (first, second) = (self.device(a)?, self.device(b)?);
        if a == b {
            return Ok((first.allocations(), None));
        }
        if a < b {
            let a_table = first.allocations();
            Ok((a_table, Some(second.allocations())))
        } else {
            let b_table = second.allocations();
            Ok((first.allocations(), Some(b_table)))
        }
    }
}

impl Platform for CpuPlatform {
    fn name(&self) -> &'static str {
        NAME
    }

    fn dev_count(&self) -> usize {
        self.devices.len()
    }

    fn device_info(&self, dev: usize) -> PlatformResult<DeviceInfo> {
        Ok(self.device(dev)?.info.clone())
    }

    fn alloc(&self, dev: usize, size: usize) -> PlatformResult<DevicePtr> {
        self.allocate(dev, size, Residency::Device)
    }

    fn alloc_host(&self, dev: usize, size: usize) -> PlatformResult<DevicePtr> {
        self.allocate(dev, size, Residency::HostPinned)
    }

    fn alloc_unified(&self, dev: usize, size: usize) -> PlatformResult<DevicePtr> {
        self.allocate(dev, size, Residency::Unified)
    }

    fn get_device_ptr(&self, dev: usize, ptr: DevicePtr) -> PlatformResult<DevicePtr> {
        let allocation = self.device(dev)?.allocations().get(dev, ptr)?;
        if allocation.residency == Residency::Device {
            return Err(PlatformError::ResidencyMismatch {
                device: dev,
                ptr,
                expected: "host-pinned or unified",
                actual: allocation.residency,
            });
        }
        Ok(ptr)
    }

    fn release(&self, dev: usize, ptr: DevicePtr) -> PlatformResult<()> {
        self.free(
            dev,
            ptr,
            &[Residency::Device, Residency::Unified],
            "device or unified",
        )
    }

    fn release_host(&self, dev: usize, ptr: DevicePtr) -> PlatformResult<()> {
        self.free(dev, ptr, &[Residency::HostPinned], "host-pinned")
    }

    fn launch_kernel(&self, dev: usize, params: &LaunchParams) -> PlatformResult<()> {
        let device = self.device(dev)?;
        let kernel = match &params.kernel {
            KernelRef::Native(kernel) => *kernel,
            KernelRef::Module { module, name } => {
                return Err(PlatformError::InvalidKernel {
                    platform: NAME,
                    reason: format!("module kernel `{}::{}` needs a driver backend", module, name),
                })
            }
        };

        let global = params.global_size()?;
        device.state.send(
            dev,
            Command::Launch {
                kernel,
                args: params.args.clone(),
                global,
            },
        )
    }

    fn synchronize(&self, dev: usize) -> PlatformResult<()> {
        let device = self.device(dev)?;
        let (done, wait) = mpsc::channel();
        device.state.send(dev, Command::Fence(done))?;
        wait.recv()
            .map_err(|_| PlatformError::QueueDisconnected { device: dev })
    }

    fn copy(
        &self,
        src_dev: usize,
        src: DevicePtr,
        src_off: usize,
        dst_dev: usize,
        dst: DevicePtr,
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()> {
        // Held until the command is queued, so a release drains it before freeing.
        let (src_table, dst_table) = self.lock_pair(src_dev, dst_dev)?;
        src_table.check_range(src_dev, src, src_off, size)?;
        dst_table
            .as_deref()
            .unwrap_or(&*src_table)
            .check_range(dst_dev, dst, dst_off, size)?;

        // Order after outstanding writes to the source on its own queue.
        if src_dev != dst_dev {
            self.synchronize(src_dev)?;
        }
        self.device(dst_dev)?.state.send(
            dst_dev,
            Command::Copy {
                src: src.offset(src_off).0,
                dst: dst.offset(dst_off).0,
                size,
            },
        )
    }

    fn copy_from_host(
        &self,
        src: &[u8],
        src_off: usize,
        dst_dev: usize,
        dst: DevicePtr,
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()> {
        check_bounds(src_off, size, src.len())?;
        let table = self.device(dst_dev)?.allocations();
        table.check_range(dst_dev, dst, dst_off, size)?;
        self.synchronize(dst_dev)?;

        // SAFETY: destination range checked above and kept live by the table
        // lock, queue drained.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src[src_off..].as_ptr(),
                dst.offset(dst_off).0 as *mut u8,
                size,
            )
        };
        drop(table);
        Ok(())
    }

    fn copy_to_host(
        &self,
        src_dev: usize,
        src: DevicePtr,
        src_off: usize,
        dst: &mut [u8],
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()> {
        check_bounds(dst_off, size, dst.len())?;
        let table = self.device(src_dev)?.allocations();
        table.check_range(src_dev, src, src_off, size)?;
        self.synchronize(src_dev)?;

        // SAFETY: source range checked above and kept live by the table lock,
        // queue drained.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.offset(src_off).0 as *const u8,
                dst[dst_off..].as_mut_ptr(),
                size,
            )
        };
        drop(table);
        Ok(())
    }
}

impl Drop for CpuPlatform {
    fn drop(&mut self) {
        for device in &self.devices {
            device.state.shutdown();
            for (ptr, allocation) in device.allocations().drain() {
                if let Ok(layout) = Self::layout(allocation.size) {
                    // SAFETY: the worker has stopped; every live entry came from `allocate`.
                    unsafe { dealloc(ptr.0 as *mut u8, layout) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::DeviceId;

    unsafe extern "C" fn fill_index(args: *const u8, x: u32, _y: u32, _z: u32) {
        let base = (args as *const u64).read_unaligned() as *mut u32;
        base.add(x as usize).write(x * 10);
    }

    #[test]
    fn test_round_trip_copy() {
        let _ = env_logger::builder().is_test(true).try_init();
        let cpu = CpuPlatform::new(1).unwrap();
        let ptr = cpu.alloc(0, 8).unwrap();
        cpu.copy_from_host(&[1, 2, 3, 4, 5, 6, 7, 8], 0, 0, ptr, 0, 8).unwrap();

        let mut out = [0u8; 8];
        cpu.copy_to_host(0, ptr, 0, &mut out, 0, 8).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        cpu.release(0, ptr).unwrap();
    }

    #[test]
    fn test_launch_over_grid() {
        let cpu = CpuPlatform::new(1).unwrap();
        let ptr = cpu.alloc(0, 4 * 8).unwrap();
        let params = LaunchParams::new(DeviceId(0), KernelRef::Native(fill_index))
            .grid([2, 1, 1])
            .block([4, 1, 1])
            .args(KernelArgs::new().push_ptr(ptr));
        cpu.launch_kernel(0, &params).unwrap();
        cpu.synchronize(0).unwrap();

        let mut out = [0u8; 32];
        cpu.copy_to_host(0, ptr, 0, &mut out, 0, 32).unwrap();
        let values: Vec<u32> = out
            .chunks(4)
            .map(|c| u32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }

    #[test]
    fn test_zero_sized_and_module_kernels() {
        let cpu = CpuPlatform::new(2).unwrap();
        let ptr = cpu.alloc(1, 0).unwrap();
        assert!(cpu.copy_from_host(&[], 0, 1, ptr, 0, 0).is_ok());
        assert!(matches!(
            cpu.copy_from_host(&[1], 0, 1, ptr, 0, 1),
            Err(PlatformError::OutOfBounds { .. })
        ));
        cpu.release(1, ptr).unwrap();

        let params = LaunchParams::new(DeviceId(0), KernelRef::module("m", "k"));
        assert!(matches!(
            cpu.launch_kernel(0, &params),
            Err(PlatformError::InvalidKernel { .. })
        ));
        assert!(matches!(
            cpu.alloc(2, 8),
            Err(PlatformError::InvalidLocalDevice { index: 2, count: 2, .. })
        ));
    }

    #[test]
    fn test_oversized_launch_is_rejected() {
        let cpu = CpuPlatform::new(1).unwrap();
        let params = LaunchParams::new(DeviceId(0), KernelRef::Native(fill_index))
            .grid([65536, 1, 1])
            .block([65536, 1, 1]);
        assert!(matches!(
            cpu.launch_kernel(0, &params),
            Err(PlatformError::LaunchExtent { .. })
        ));
        cpu.synchronize(0).unwrap();
    }

    #[test]
    fn test_device_ptr_needs_host_visible_memory() {
        let cpu = CpuPlatform::new(1).unwrap();
        let device = cpu.alloc(0, 8).unwrap();
        assert!(matches!(
            cpu.get_device_ptr(0, device),
            Err(PlatformError::ResidencyMismatch {
                actual: Residency::Device,
                ..
            })
        ));
        let unified = cpu.alloc_unified(0, 8).unwrap();
        assert_eq!(cpu.get_device_ptr(0, unified), Ok(unified));
    }

    #[test]
    fn test_release_races_with_host_copies() {
        let cpu = CpuPlatform::new(2).unwrap();
        for _ in 0..64 {
            let ptr = cpu.alloc(0, 4096).unwrap();
            let other = cpu.alloc(1, 4096).unwrap();
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    let mut out = vec![0u8; 4096];
                    loop {
                        let read = cpu.copy_to_host(0, ptr, 0, &mut out, 0, 4096);
                        let queued = cpu.copy(0, ptr, 0, 1, other, 0, 4096);
                        match (read, queued) {
                            (Ok(()), Ok(())) => continue,
                            (read, queued) => {
                                for result in [read, queued] {
                                    assert!(matches!(
                                        result,
                                        Ok(()) | Err(PlatformError::UseAfterRelease { .. })
                                    ));
                                }
                                break;
                            }
                        }
                    }
                });
                cpu.release(0, ptr).unwrap();
            });
            cpu.release(1, other).unwrap();
        }
    }
}
