// This module implements the Runtime registry that joins every registered platform into one flat
// DeviceId space. Registering a platform with n devices assigns it the ids base..base+n where base
// is the number of devices registered before it, so ids are dense and stable for the lifetime of
// the registry. Every device-scoped call finds the owning platform by range lookup and forwards
// with the local index. Registration needs &mut Runtime and dispatch only &Runtime, so a fully
// registered runtime can be shared behind an Arc. Allocations are handed out as MemoryBlock
// values that remember their device, pointer, size and residency; release consumes the block,
// which makes a second release through the registry impossible to express.

//! Flat device registry over all platforms.

use crate::core::{PlatformError, PlatformResult};
use crate::platform::{
    device::check_bounds, CpuPlatform, DeviceId, DeviceInfo, DevicePtr, LaunchParams, Platform,
    Residency,
};
use std::fmt;

/// Contiguous block of device ids owned by one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRange {
    pub start: DeviceId,
    pub end: DeviceId,
}

impl DeviceRange {
    pub fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: DeviceId) -> bool {
        self.start <= id && id < self.end
    }

    pub fn iter(&self) -> impl Iterator<Item = DeviceId> {
        (self.start.0..self.end.0).map(DeviceId)
    }
}

impl fmt::Display for DeviceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// One registered device as listed by [`Runtime::devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub platform: &'static str,
    pub local_index: usize,
    pub info: DeviceInfo,
}

/// An allocation made through the runtime.
///
/// Not `Clone`: the block is consumed by [`Runtime::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    device: DeviceId,
    ptr: DevicePtr,
    size: usize,
    residency: Residency,
}

impl MemoryBlock {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }
}

struct Entry {
    platform: Box<dyn Platform>,
    range: DeviceRange,
}

/// Registry of platforms with a flat device id space.
#[derive(Default)]
pub struct Runtime {
    entries: Vec<Entry>,
    total: usize,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// A runtime with a CPU platform sized from the environment.
    pub fn with_host_platform() -> PlatformResult<Self> {
        let mut runtime = Self::new();
        runtime.register(Box::new(CpuPlatform::from_env()?));
        Ok(runtime)
    }

    /// Register `platform`, assigning the next `dev_count()` ids to it.
    pub fn register(&mut self, platform: Box<dyn Platform>) -> DeviceRange {
        let count = platform.dev_count();
        let range = DeviceRange {
            start: DeviceId(self.total),
            end: DeviceId(self.total + count),
        };
        self.total += count;
        log::info!(
            "registered {} platform: {} device(s), ids {}",
            platform.name(),
            count,
            range
        );
        self.entries.push(Entry { platform, range });
        range
    }

    pub fn dev_count(&self) -> usize {
        self.total
    }

    /// All registered devices in id order.
    pub fn devices(&self) -> PlatformResult<Vec<DeviceDescriptor>> {
        let mut out = Vec::with_capacity(self.total);
        for entry in &self.entries {
            for (local_index, id) in entry.range.iter().enumerate() {
                out.push(DeviceDescriptor {
                    id,
                    platform: entry.platform.name(),
                    local_index,
                    info: entry.platform.device_info(local_index)?,
                });
            }
        }
        Ok(out)
    }

    pub fn platform_name(&self, dev: DeviceId) -> PlatformResult<&'static str> {
        Ok(self.resolve(dev)?.0.platform.name())
    }

    fn resolve(&self, dev: DeviceId) -> PlatformResult<(&Entry, usize)> {
        self.entries
            .iter()
            .find(|entry| entry.range.contains(dev))
            .map(|entry| (entry, dev.0 - entry.range.start.0))
            .ok_or(PlatformError::InvalidDevice(dev))
    }

    fn block(
        &self,
        dev: DeviceId,
        size: usize,
        residency: Residency,
        alloc: impl FnOnce(&dyn Platform, usize) -> PlatformResult<DevicePtr>,
    ) -> PlatformResult<MemoryBlock> {
        let (entry, local) = self.resolve(dev)?;
        let ptr = alloc(entry.platform.as_ref(), local)?;
        Ok(MemoryBlock {
            device: dev,
            ptr,
            size,
            residency,
        })
    }

    pub fn alloc(&self, dev: DeviceId, size: usize) -> PlatformResult<MemoryBlock> {
        self.block(dev, size, Residency::Device, |p, local| p.alloc(local, size))
    }

    pub fn alloc_host(&self, dev: DeviceId, size: usize) -> PlatformResult<MemoryBlock> {
        self.block(dev, size, Residency::HostPinned, |p, local| {
            p.alloc_host(local, size)
        })
    }

    pub fn alloc_unified(&self, dev: DeviceId, size: usize) -> PlatformResult<MemoryBlock> {
        self.block(dev, size, Residency::Unified, |p, local| {
            p.alloc_unified(local, size)
        })
    }

    pub fn get_device_ptr(&self, block: &MemoryBlock) -> PlatformResult<DevicePtr> {
        let (entry, local) = self.resolve(block.device)?;
        entry.platform.get_device_ptr(local, block.ptr)
    }

    /// Release `block`, routing host-pinned blocks to `release_host`.
    pub fn release(&self, block: MemoryBlock) -> PlatformResult<()> {
        let (entry, local) = self.resolve(block.device)?;
        match block.residency {
            Residency::HostPinned => entry.platform.release_host(local, block.ptr),
            Residency::Device | Residency::Unified => entry.platform.release(local, block.ptr),
        }
    }

    pub fn launch_kernel(&self, params: &LaunchParams) -> PlatformResult<()> {
        let (entry, local) = self.resolve(params.device)?;
        entry.platform.launch_kernel(local, params)
    }

    pub fn synchronize(&self, dev: DeviceId) -> PlatformResult<()> {
        let (entry, local) = self.resolve(dev)?;
        entry.platform.synchronize(local)
    }

    pub fn synchronize_all(&self) -> PlatformResult<()> {
        for entry in &self.entries {
            for local in 0..entry.range.len() {
                entry.platform.synchronize(local)?;
            }
        }
        Ok(())
    }

    /// Copy `size` bytes between two blocks.
    ///
    /// Blocks on different platforms are staged through host memory after
    /// the source device has been synchronized.
    pub fn copy(
        &self,
        src: &MemoryBlock,
        src_off: usize,
        dst: &MemoryBlock,
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()> {
        let (src_entry, src_local) = self.resolve(src.device)?;
        let (dst_entry, dst_local) = self.resolve(dst.device)?;

        if std::ptr::eq(src_entry, dst_entry) {
            return src_entry.platform.copy(
                src_local, src.ptr, src_off, dst_local, dst.ptr, dst_off, size,
            );
        }

        check_bounds(src_off, size, src.size)?;
        check_bounds(dst_off, size, dst.size)?;
        log::debug!(
            "staging {} bytes from {} device {} to {} device {}",
            size,
            src_entry.platform.name(),
            src.device,
            dst_entry.platform.name(),
            dst.device
        );
        let mut staging = vec![0u8; size];
        src_entry.platform.synchronize(src_local)?;
        src_entry
            .platform
            .copy_to_host(src_local, src.ptr, src_off, &mut staging, 0, size)?;
        dst_entry
            .platform
            .copy_from_host(&staging, 0, dst_local, dst.ptr, dst_off, size)
    }

    pub fn copy_from_host(
        &self,
        src: &[u8],
        src_off: usize,
        dst: &MemoryBlock,
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()> {
        let (entry, local) = self.resolve(dst.device)?;
        entry
            .platform
            .copy_from_host(src, src_off, local, dst.ptr, dst_off, size)
    }

    pub fn copy_to_host(
        &self,
        src: &MemoryBlock,
        src_off: usize,
        dst: &mut [u8],
        dst_off: usize,
        size: usize,
    ) -> PlatformResult<()> {
        let (entry, local) = self.resolve(src.device)?;
        entry
            .platform
            .copy_to_host(local, src.ptr, src_off, dst, dst_off, size)
    }
}
