// This module implements the accelerator platforms on top of the DeviceDriver boundary. One
// DriverPlatform type serves all four driver families; the BackendKind tag selects which driver
// objects a device record owns (CUDA: context; OpenCL: context and queue; HSA: queue only;
// Vulkan: logical device and queue) and which capabilities are refused. Devices are enumerated
// once at construction in driver order, which fixes the local indices. Kernel modules are
// loaded once per device and name and kept in a cache together with resolved kernel handles.
// Host copies go through the device queue and wait for it, so they observe all earlier work;
// device-to-device copies are queued, except on Vulkan where they complete before returning.

//! Driver-backed accelerator platforms.

use super::device::{check_bounds, local, Device};
use super::driver::{DeviceDriver, Handle};
use super::{
    unsupported, BackendKind, DeviceInfo, DevicePtr, KernelRef, LaunchParams, Platform,
    Residency,
};
use crate::core::{PlatformError, PlatformResult};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Driver objects owned by one device.
struct DeviceHandles {
    device: Handle,
    context: Option<Handle>,
    queue: Handle,
    modules: Mutex<HashMap<String, Handle>>,
    kernels: Mutex<HashMap<(String, String), Handle>>,
}

/// Which parts of the capability set a backend family provides.
#[derive(Debug, Clone, Copy)]
struct Capabilities {
    unified: bool,
    device_ptr: DevicePtrMapping,
    sync_copies: bool,
    context: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DevicePtrMapping {
    Driver,
    Identity,
    Unsupported,
}

impl Capabilities {
    fn of(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Cuda => Self {
                unified: true,
                device_ptr: DevicePtrMapping::Driver,
                sync_copies: false,
                context: true,
            },
            BackendKind::OpenCl => Self {
                unified: false,
                device_ptr: DevicePtrMapping::Unsupported,
                sync_copies: false,
                context: true,
            },
            BackendKind::Hsa => Self {
                unified: true,
                device_ptr: DevicePtrMapping::Identity,
                sync_copies: false,
                context: false,
            },
            BackendKind::Vulkan | BackendKind::Cpu => Self {
                unified: false,
                device_ptr: DevicePtrMapping::Driver,
                sync_copies: true,
                context: true,
            },
        }
    }
}

/// A platform whose devices are driven through a [`DeviceDriver`].
pub struct DriverPlatform {
    kind: BackendKind,
    caps: Capabilities,
    driver: Arc<dyn DeviceDriver>,
    devices: Vec<Device<DeviceHandles>>,
}

impl DriverPlatform {
    /// Enumerate the driver's devices and create their contexts and queues.
    pub fn new(kind: BackendKind, driver: Arc<dyn DeviceDriver>) -> PlatformResult<Self> {
        // The host backend is CpuPlatform.
        if kind == BackendKind::Cpu {
            return unsupported(kind.name(), "driver platform");
        }

        let caps = Capabilities::of(kind);
        let mut platform = Self {
            kind,
            caps,
            driver,
            devices: Vec::new(),
        };

        for (index, dev) in platform.driver.enumerate()?.into_iter().enumerate() {
            // Pushed one at a time so Drop cleans up devices created before a failure.
            let context = match caps.context {
                true => Some(platform.driver.create_context(dev.handle)?),
                false => None,
            };
            let queue = match platform.driver.create_queue(dev.handle) {
                Ok(queue) => queue,
                Err(e) => {
                    if let Some(context) = context {
                        let _ = platform.driver.destroy_context(context);
                    }
                    return Err(e.into());
                }
            };

            let info = DeviceInfo {
                name: dev.name,
                total_memory: dev.total_memory,
                backend: kind,
            };
            let handles = DeviceHandles {
                device: dev.handle,
                context,
                queue,
                modules: Mutex::new(HashMap::new()),
                kernels: Mutex::new(HashMap::new()),
            };
            platform.devices.push(Device::new(index, info, handles));
        }

        log::info!(
            "{} platform initialized with {} device(s)",
            kind.name(),
            platform.devices.len()
        );
        Ok(platform)
    }

    pub fn cuda(driver: Arc<dyn DeviceDriver>) -> PlatformResult<Self> {
        Self::new(BackendKind::Cuda, driver)
    }

    pub fn opencl(driver: Arc<dyn DeviceDriver>) -> PlatformResult<Self> {
        Self::new(BackendKind::OpenCl, driver)
    }

    pub fn hsa(driver: Arc<dyn DeviceDriver>) -> PlatformResult<Self> {
        Self::new(BackendKind::Hsa, driver)
    }

    pub fn vulkan(driver: Arc<dyn DeviceDriver>) -> PlatformResult<Self> {
        Self::new(BackendKind::Vulkan, driver)
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    fn device(&self, dev: usize) -> PlatformResult<&Device<DeviceHandles>> {
        local(&self.devices, self.kind.name(), dev)
    }

    fn allocate(&self, dev: usize, size: usize, residency: Residency) -> PlatformResult<DevicePtr> {
        let device = self.device(dev)?;
        let address = self.driver.mem_alloc(device.state.device, size, residency)?;
        let ptr = DevicePtr(address);
        device.allocations().insert(ptr, size, residency);
        log::trace!(
            "{} device {}: {:?} alloc {} bytes at {}",
            self.kind,
            dev,
            residency,
            size,
            ptr
        );
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
        self.driver.wait(device.state.queue)?;
        let allocation = table.remove(dev, ptr, accepted, expected)?;
        if let Err(e) = self.driver.mem_free(ptr.addr()) {
            // Still owned by the driver, so still live.
            table.insert(ptr, allocation.size, allocation.residency);
            return Err(e.into());
        }
        Ok(())
    }

    /// Module handle for `module` on `device`, loading it on first use.
    fn module(&self, device: &Device<DeviceHandles>, module: &str) -> PlatformResult<Handle> {
        let mut modules = device.state.modules.lock();
        if let Some(&handle) = modules.get(module) {
            return Ok(handle);
        }
        let handle = self.driver.load_module(device.state.device, module)?;
        log::debug!("{} device {}: loaded module `{}`", self.kind, device.index, module);
        modules.insert(module.to_string(), handle);
        Ok(handle)
    }

    fn kernel(
        &self,
        device: &Device<DeviceHandles>,
        module: &str,
        name: &str,
    ) -> PlatformResult<Handle> {
        let key = (module.to_string(), name.to_string());
        if let Some(&handle) = device.state.kernels.lock().get(&key) {
            return Ok(handle);
        }
        let module = self.module(device, module)?;
        let handle = self.driver.kernel(module, name)?;
        device.state.kernels.lock().insert(key, handle);
        Ok(handle)
    }
}

impl Platform for DriverPlatform {
    fn name(&self) -> &'static str {
        self.kind.name()
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
        if !self.caps.unified {
            return unsupported(self.name(), "alloc_unified");
        }
        self.allocate(dev, size, Residency::Unified)
    }

    fn get_device_ptr(&self, dev: usize, ptr: DevicePtr) -> PlatformResult<DevicePtr> {
        if self.caps.device_ptr == DevicePtrMapping::Unsupported {
            return unsupported(self.name(), "get_device_ptr");
        }

        let allocation = self.device(dev)?.allocations().get(dev, ptr)?;
        if allocation.residency == Residency::Device {
            return Err(PlatformError::ResidencyMismatch {
                device: dev,
                ptr,
                expected: "host-pinned or unified",
                actual: allocation.residency,
            });
        }

        match self.caps.device_ptr {
            DevicePtrMapping::Identity => Ok(ptr),
            _ => Ok(DevicePtr(self.driver.host_to_device_ptr(ptr.addr())?)),
        }
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
        let (module, name) = match &params.kernel {
            KernelRef::Module { module, name } => (module, name),
            KernelRef::Native(_) => {
                return Err(PlatformError::InvalidKernel {
                    platform: self.name(),
                    reason: "native host functions cannot run on a driver device".to_string(),
                })
            }
        };

        params.global_size()?;
        let kernel = self.kernel(device, module, name)?;
        log::trace!(
            "{} device {}: launch `{}::{}` grid {:?} block {:?}",
            self.kind,
            dev,
            module,
            name,
            params.grid,
            params.block
        );
        self.driver.enqueue_launch(
            device.state.queue,
            kernel,
            params.grid,
            params.block,
            params.args.as_bytes(),
        )?;
        Ok(())
    }

    fn synchronize(&self, dev: usize) -> PlatformResult<()> {
        let device = self.device(dev)?;
        self.driver.wait(device.state.queue)?;
        Ok(())
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
        self.device(src_dev)?
            .allocations()
            .check_range(src_dev, src, src_off, size)?;
        let dst_device = self.device(dst_dev)?;
        dst_device
            .allocations()
            .check_range(dst_dev, dst, dst_off, size)?;

        if src_dev != dst_dev {
            self.synchronize(src_dev)?;
        }
        let queue = dst_device.state.queue;
        self.driver.enqueue_copy(
            queue,
            src.offset(src_off).addr(),
            dst.offset(dst_off).addr(),
            size,
        )?;
        if self.caps.sync_copies {
            self.driver.wait(queue)?;
        }
        Ok(())
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
        let device = self.device(dst_dev)?;
        device
            .allocations()
            .check_range(dst_dev, dst, dst_off, size)?;

        let queue = device.state.queue;
        self.driver.enqueue_write(
            queue,
            dst.offset(dst_off).addr(),
            &src[src_off..src_off + size],
        )?;
        self.driver.wait(queue)?;
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
        let device = self.device(src_dev)?;
        device
            .allocations()
            .check_range(src_dev, src, src_off, size)?;

        self.driver.read(
            device.state.queue,
            src.offset(src_off).addr(),
            &mut dst[dst_off..dst_off + size],
        )?;
        Ok(())
    }
}

impl Drop for DriverPlatform {
    fn drop(&mut self) {
        for device in &self.devices {
            let handles = &device.state;
            if let Err(e) = self.driver.wait(handles.queue) {
                log::error!("{} device {}: wait on drop failed: {}", self.kind, device.index, e);
            }
            for (ptr, _) in device.allocations().drain() {
                if let Err(e) = self.driver.mem_free(ptr.addr()) {
                    log::error!("{} device {}: leaked {}: {}", self.kind, device.index, ptr, e);
                }
            }
            if let Err(e) = self.driver.destroy_queue(handles.queue) {
                log::error!("{} device {}: destroy queue: {}", self.kind, device.index, e);
            }
            if let Some(context) = handles.context {
                if let Err(e) = self.driver.destroy_context(context) {
                    log::error!("{} device {}: destroy context: {}", self.kind, device.index, e);
                }
            }
        }
    }
}
