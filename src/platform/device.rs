//! Per-device bookkeeping shared by all platforms.

use super::{DeviceInfo, DevicePtr, Residency};
use crate::core::{PlatformError, PlatformResult};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;

/// Released pointers remembered per device for double-release and
/// use-after-release reports. Older ones are reported as unknown.
pub const RELEASED_HISTORY: usize = 4096;

/// A live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub size: usize,
    pub residency: Residency,
}

/// Live and released pointers of one device.
#[derive(Debug, Default)]
pub struct AllocationTable {
    live: HashMap<DevicePtr, Allocation>,
    released: HashSet<DevicePtr>,
    release_order: VecDeque<DevicePtr>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ptr: DevicePtr, size: usize, residency: Residency) {
        // The allocator may hand out a released address again.
        if self.released.remove(&ptr) {
            self.release_order.retain(|&p| p != ptr);
        }
        self.live.insert(ptr, Allocation { size, residency });
    }

    /// The live allocation starting at `ptr`.
    pub fn get(&self, device: usize, ptr: DevicePtr) -> PlatformResult<Allocation> {
        match self.live.get(&ptr) {
            Some(allocation) => Ok(*allocation),
            None if self.released.contains(&ptr) => {
                Err(PlatformError::UseAfterRelease { device, ptr })
            }
            None => Err(PlatformError::UnknownAllocation { device, ptr }),
        }
    }

    /// Check that `offset..offset + size` lies inside the allocation at `ptr`.
    pub fn check_range(
        &self,
        device: usize,
        ptr: DevicePtr,
        offset: usize,
        size: usize,
    ) -> PlatformResult<Allocation> {
        let allocation = self.get(device, ptr)?;
        check_bounds(offset, size, allocation.size)?;
        Ok(allocation)
    }

    /// Remove the allocation at `ptr` if its residency is one of `accepted`.
    pub fn remove(
        &mut self,
        device: usize,
        ptr: DevicePtr,
        accepted: &[Residency],
        expected: &'static str,
    ) -> PlatformResult<Allocation> {
        let allocation = match self.live.get(&ptr) {
            Some(allocation) => *allocation,
            None if self.released.contains(&ptr) => {
                return Err(PlatformError::DoubleRelease { device, ptr })
            }
            None => return Err(PlatformError::UnknownAllocation { device, ptr }),
        };

        if !accepted.contains(&allocation.residency) {
            return Err(PlatformError::ResidencyMismatch {
                device,
                ptr,
                expected,
                actual: allocation.residency,
            });
        }

        self.live.remove(&ptr);
        self.released.insert(ptr);
        self.release_order.push_back(ptr);
        if self.release_order.len() > RELEASED_HISTORY {
            if let Some(oldest) = self.release_order.pop_front() {
                self.released.remove(&oldest);
            }
        }
        Ok(allocation)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Released pointers currently remembered.
    pub fn released_len(&self) -> usize {
        self.released.len()
    }

    /// Remove and return every live allocation.
    pub fn drain(&mut self) -> Vec<(DevicePtr, Allocation)> {
        self.live.drain().collect()
    }
}

/// Check `offset..offset + size` against a buffer of `capacity` bytes.
pub fn check_bounds(offset: usize, size: usize, capacity: usize) -> PlatformResult<()> {
    match offset.checked_add(size) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(PlatformError::OutOfBounds {
            offset,
            size,
            capacity,
        }),
    }
}

/// One device owned by a platform.
///
/// `S` is the backend-specific state, e.g. a worker queue or driver handles.
pub struct Device<S> {
    pub index: usize,
    pub info: DeviceInfo,
    pub state: S,
    allocations: Mutex<AllocationTable>,
}

impl<S> Device<S> {
    pub fn new(index: usize, info: DeviceInfo, state: S) -> Self {
        Self {
            index,
            info,
            state,
            allocations: Mutex::new(AllocationTable::new()),
        }
    }

    pub fn allocations(&self) -> MutexGuard<'_, AllocationTable> {
        self.allocations.lock()
    }
}

/// Look up local device `index`.
pub(crate) fn local<'d, S>(
    devices: &'d [Device<S>],
    platform: &'static str,
    index: usize,
) -> PlatformResult<&'d Device<S>> {
    devices
        .get(index)
        .ok_or(PlatformError::InvalidLocalDevice {
            platform,
            index,
            count: devices.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_lifecycle() {
        let mut table = AllocationTable::new();
        let ptr = DevicePtr(0x1000);
        table.insert(ptr, 64, Residency::Device);

        assert_eq!(table.get(0, ptr).unwrap().size, 64);
        table.remove(0, ptr, &[Residency::Device], "device").unwrap();
        assert_eq!(
            table.remove(0, ptr, &[Residency::Device], "device"),
            Err(PlatformError::DoubleRelease { device: 0, ptr })
        );
        assert_eq!(table.get(0, ptr), Err(PlatformError::UseAfterRelease { device: 0, ptr }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_residency_and_unknown_pointer() {
        let mut table = AllocationTable::new();
        let ptr = DevicePtr(0x2000);
        table.insert(ptr, 16, Residency::HostPinned);

        assert!(matches!(
            table.remove(1, ptr, &[Residency::Device, Residency::Unified], "device or unified"),
            Err(PlatformError::ResidencyMismatch {
                actual: Residency::HostPinned,
                ..
            })
        ));
        assert_eq!(
            table.get(1, DevicePtr(0x3000)),
            Err(PlatformError::UnknownAllocation {
                device: 1,
                ptr: DevicePtr(0x3000)
            })
        );
        // Still live after the refused release.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_release_history_is_bounded() {
        let mut table = AllocationTable::new();
        let ptrs = (0..RELEASED_HISTORY as u64 + 10)
            .map(|i| DevicePtr(0x1_0000 + i * 256))
            .collect::<Vec<_>>();
        for &ptr in &ptrs {
            table.insert(ptr, 8, Residency::Device);
            table.remove(0, ptr, &[Residency::Device], "device").unwrap();
        }
        assert_eq!(table.released_len(), RELEASED_HISTORY);

        let oldest = ptrs[0];
        assert_eq!(
            table.get(0, oldest),
            Err(PlatformError::UnknownAllocation { device: 0, ptr: oldest })
        );
        let newest = ptrs[ptrs.len() - 1];
        assert_eq!(
            table.remove(0, newest, &[Residency::Device], "device"),
            Err(PlatformError::DoubleRelease { device: 0, ptr: newest })
        );

        // Reuse of a remembered address forgets its release.
        table.insert(newest, 8, Residency::Device);
        assert_eq!(table.released_len(), RELEASED_HISTORY - 1);
        assert!(table.get(0, newest).is_ok());
    }

    #[test]
    fn test_bounds() {
        assert!(check_bounds(0, 16, 16).is_ok());
        assert!(check_bounds(16, 0, 16).is_ok());
        assert!(check_bounds(8, 9, 16).is_err());
        assert!(check_bounds(usize::MAX, 2, 16).is_err());
    }
}
