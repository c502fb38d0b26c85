// This module provides ReferenceDriver, a DeviceDriver implementation backed by host memory. It
// lets every DriverPlatform flavour run without vendor hardware: buffers live in host vectors
// addressed by synthetic device addresses, queued operations are deferred until the queue is
// waited on or read from (exposing ordering bugs a synchronous fake would hide), and kernels
// are Rust closures registered under a (module, name) pair. Device count, name and memory size
// are configurable so tests can build platforms of any shape.

//! Host-memory reference implementation of [`DeviceDriver`].

use super::driver::{DeviceDriver, DriverDevice, Handle};
use super::Residency;
use crate::core::DriverError;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

const BASE_ADDRESS: u64 = 0x1_0000_0000;
const ADDRESS_ALIGN: u64 = 256;

/// A kernel implemented on the host.
pub type HostKernel = Arc<dyn Fn(&mut KernelContext<'_>) -> Result<(), DriverError> + Send + Sync>;

/// What a [`HostKernel`] sees while it runs.
pub struct KernelContext<'m> {
    pub grid: [u32; 3],
    pub block: [u32; 3],
    args: &'m [u8],
    memory: &'m mut BTreeMap<u64, Buffer>,
}

impl<'m> KernelContext<'m> {
    pub fn args(&self) -> &[u8] {
        self.args
    }

    /// Argument at `offset` in the blob, read as a `u64` (pointers, `i64`).
    pub fn arg_u64(&self, offset: usize) -> Result<u64, DriverError> {
        super::read_arg_u64(self.args, offset)
            .ok_or_else(|| DriverError::Backend(format!("no u64 argument at offset {}", offset)))
    }

    pub fn arg_u32(&self, offset: usize) -> Result<u32, DriverError> {
        super::read_arg_u32(self.args, offset)
            .ok_or_else(|| DriverError::Backend(format!("no u32 argument at offset {}", offset)))
    }

    pub fn read(&self, address: u64, out: &mut [u8]) -> Result<(), DriverError> {
        let (buffer, start) = resolve(self.memory, address, out.len())?;
        out.copy_from_slice(&buffer.data[start..start + out.len()]);
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), DriverError> {
        let (buffer, start) = resolve_mut(self.memory, address, data.len())?;
        buffer.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, address: u64) -> Result<u32, DriverError> {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes)?;
        Ok(u32::from_ne_bytes(bytes))
    }

    pub fn write_u32(&mut self, address: u64, value: u32) -> Result<(), DriverError> {
        self.write(address, &value.to_ne_bytes())
    }

    pub fn read_i64(&self, address: u64) -> Result<i64, DriverError> {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes)?;
        Ok(i64::from_ne_bytes(bytes))
    }

    pub fn write_i64(&mut self, address: u64, value: i64) -> Result<(), DriverError> {
        self.write(address, &value.to_ne_bytes())
    }
}

struct Buffer {
    data: Vec<u8>,
    device: Handle,
    residency: Residency,
}

fn resolve(
    memory: &BTreeMap<u64, Buffer>,
    address: u64,
    len: usize,
) -> Result<(&Buffer, usize), DriverError> {
    let (&base, buffer) = memory
        .range(..=address)
        .next_back()
        .ok_or(DriverError::InvalidAddress { address })?;
    let start = (address - base) as usize;
    if start + len > buffer.data.len() {
        return Err(DriverError::InvalidAddress { address });
    }
    Ok((buffer, start))
}

fn resolve_mut(
    memory: &mut BTreeMap<u64, Buffer>,
    address: u64,
    len: usize,
) -> Result<(&mut Buffer, usize), DriverError> {
    let (&base, buffer) = memory
        .range_mut(..=address)
        .next_back()
        .ok_or(DriverError::InvalidAddress { address })?;
    let start = (address - base) as usize;
    if start + len > buffer.data.len() {
        return Err(DriverError::InvalidAddress { address });
    }
    Ok((buffer, start))
}

enum Op {
    Write { dst: u64, data: Vec<u8> },
    Copy { src: u64, dst: u64, size: usize },
    Launch {
        kernel: HostKernel,
        grid: [u32; 3],
        block: [u32; 3],
        args: Vec<u8>,
    },
}

#[derive(Default)]
struct State {
    next_handle: Handle,
    next_address: u64,
    memory: BTreeMap<u64, Buffer>,
    used: HashMap<Handle, u64>,
    contexts: HashSet<Handle>,
    queues: HashMap<Handle, VecDeque<Op>>,
    modules: HashMap<Handle, String>,
    kernel_handles: HashMap<Handle, HostKernel>,
}

impl State {
    fn handle(&mut self) -> Handle {
        self.next_handle += 1;
        self.next_handle
    }

    fn queue(&mut self, queue: Handle) -> Result<&mut VecDeque<Op>, DriverError> {
        self.queues
            .get_mut(&queue)
            .ok_or(DriverError::InvalidHandle { handle: queue })
    }

    /// Run the ops of `queue` in order.
    ///
    /// Stops at the first failing op; the ops behind it stay queued and run on
    /// the next drain.
    fn drain(&mut self, queue: Handle) -> Result<(), DriverError> {
        loop {
            let Some(op) = self.queue(queue)?.pop_front() else {
                return Ok(());
            };
            self.run(op)?;
        }
    }

    fn run(&mut self, op: Op) -> Result<(), DriverError> {
        match op {
            Op::Write { dst, data } => {
                let (buffer, start) = resolve_mut(&mut self.memory, dst, data.len())?;
                buffer.data[start..start + data.len()].copy_from_slice(&data);
            }
            Op::Copy { src, dst, size } => {
                let mut staging = vec![0u8; size];
                let (buffer, start) = resolve(&self.memory, src, size)?;
                staging.copy_from_slice(&buffer.data[start..start + size]);
                let (buffer, start) = resolve_mut(&mut self.memory, dst, size)?;
                buffer.data[start..start + size].copy_from_slice(&staging);
            }
            Op::Launch {
                kernel,
                grid,
                block,
                args,
            } => {
                let mut ctx = KernelContext {
                    grid,
                    block,
                    args: &args,
                    memory: &mut self.memory,
                };
                kernel(&mut ctx)?;
            }
        }
        Ok(())
    }
}

/// Driver whose devices are simulated in host memory.
pub struct ReferenceDriver {
    devices: Vec<DriverDevice>,
    registry: HashMap<(String, String), HostKernel>,
    state: Mutex<State>,
}

impl ReferenceDriver {
    /// `devices` simulated devices named `"{name} {i}"` with `memory` bytes each.
    pub fn new(name: &str, devices: usize, memory: u64) -> Self {
        let devices = (0..devices)
            .map(|i| DriverDevice {
                handle: 0x100 + i as Handle,
                name: format!("{} {}", name, i),
                total_memory: memory,
            })
            .collect();

        Self {
            devices,
            registry: HashMap::new(),
            state: Mutex::new(State {
                next_handle: 0x1000,
                next_address: BASE_ADDRESS,
                ..State::default()
            }),
        }
    }

    /// Register `kernel` as `name` in module `module`.
    pub fn with_kernel(
        mut self,
        module: &str,
        name: &str,
        kernel: impl Fn(&mut KernelContext<'_>) -> Result<(), DriverError> + Send + Sync + 'static,
    ) -> Self {
        self.registry
            .insert((module.to_string(), name.to_string()), Arc::new(kernel));
        self
    }

    /// Operations queued but not yet executed, over all queues.
    pub fn pending_commands(&self) -> usize {
        self.state.lock().queues.values().map(VecDeque::len).sum()
    }

    /// Live buffers, over all devices.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().memory.len()
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn live_queues(&self) -> usize {
        self.state.lock().queues.len()
    }

    fn device(&self, handle: Handle) -> Result<&DriverDevice, DriverError> {
        self.devices
            .iter()
            .find(|d| d.handle == handle)
            .ok_or(DriverError::InvalidHandle { handle })
    }
}

impl DeviceDriver for ReferenceDriver {
    fn enumerate(&self) -> Result<Vec<DriverDevice>, DriverError> {
        Ok(self.devices.clone())
    }

    fn create_context(&self, device: Handle) -> Result<Handle, DriverError> {
        self.device(device)?;
        let mut state = self.state.lock();
        let context = state.handle();
        state.contexts.insert(context);
        Ok(context)
    }

    fn destroy_context(&self, context: Handle) -> Result<(), DriverError> {
        if self.state.lock().contexts.remove(&context) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle { handle: context })
        }
    }

    fn create_queue(&self, device: Handle) -> Result<Handle, DriverError> {
        self.device(device)?;
        let mut state = self.state.lock();
        let queue = state.handle();
        state.queues.insert(queue, VecDeque::new());
        Ok(queue)
    }

    fn destroy_queue(&self, queue: Handle) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        // Every op runs before the queue goes away; the first failure is reported.
        let mut result = Ok(());
        loop {
            let idle = state.queue(queue)?.is_empty();
            if idle {
                break;
            }
            if let Err(e) = state.drain(queue) {
                result = result.and(Err(e));
            }
        }
        state.queues.remove(&queue);
        result
    }

    fn mem_alloc(
        &self,
        device: Handle,
        size: usize,
        residency: Residency,
    ) -> Result<u64, DriverError> {
        let capacity = self.device(device)?.total_memory;
        let mut state = self.state.lock();

        let used = state.used.entry(device).or_insert(0);
        match used.checked_add(size as u64).filter(|&total| total <= capacity) {
            Some(total) => *used = total,
            None => return Err(DriverError::OutOfMemory { size }),
        }

        let address = state.next_address;
        let span = (size as u64).max(1).div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
        state.next_address += span;
        state.memory.insert(
            address,
            Buffer {
                data: vec![0; size],
                device,
                residency,
            },
        );
        Ok(address)
    }

    fn mem_free(&self, address: u64) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let buffer = state
            .memory
            .remove(&address)
            .ok_or(DriverError::InvalidAddress { address })?;
        if let Some(used) = state.used.get_mut(&buffer.device) {
            *used -= buffer.data.len() as u64;
        }
        Ok(())
    }

    fn host_to_device_ptr(&self, address: u64) -> Result<u64, DriverError> {
        let state = self.state.lock();
        match state.memory.get(&address) {
            Some(buffer) if buffer.residency != Residency::Device => Ok(address),
            _ => Err(DriverError::InvalidAddress { address }),
        }
    }

    fn load_module(&self, device: Handle, name: &str) -> Result<Handle, DriverError> {
        self.device(device)?;
        if !self.registry.keys().any(|(module, _)| module == name) {
            return Err(DriverError::ModuleNotFound {
                module: name.to_string(),
            });
        }
        let mut state = self.state.lock();
        let module = state.handle();
        state.modules.insert(module, name.to_string());
        log::debug!("reference driver: loaded module `{}` as {:#x}", name, module);
        Ok(module)
    }

    fn kernel(&self, module: Handle, name: &str) -> Result<Handle, DriverError> {
        let mut state = self.state.lock();
        let module_name = state
            .modules
            .get(&module)
            .cloned()
            .ok_or(DriverError::InvalidHandle { handle: module })?;
        let kernel = self
            .registry
            .get(&(module_name, name.to_string()))
            .cloned()
            .ok_or_else(|| DriverError::KernelNotFound {
                kernel: name.to_string(),
            })?;
        let handle = state.handle();
        state.kernel_handles.insert(handle, kernel);
        Ok(handle)
    }

    fn enqueue_write(&self, queue: Handle, dst: u64, data: &[u8]) -> Result<(), DriverError> {
        self.state.lock().queue(queue)?.push_back(Op::Write {
            dst,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn read(&self, queue: Handle, src: u64, out: &mut [u8]) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.drain(queue)?;
        let (buffer, start) = resolve(&state.memory, src, out.len())?;
        out.copy_from_slice(&buffer.data[start..start + out.len()]);
        Ok(())
    }

    fn enqueue_copy(
        &self,
        queue: Handle,
        src: u64,
        dst: u64,
        size: usize,
    ) -> Result<(), DriverError> {
        self.state
            .lock()
            .queue(queue)?
            .push_back(Op::Copy { src, dst, size });
        Ok(())
    }

    fn enqueue_launch(
        &self,
        queue: Handle,
        kernel: Handle,
        grid: [u32; 3],
        block: [u32; 3],
        args: &[u8],
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let kernel = state
            .kernel_handles
            .get(&kernel)
            .cloned()
            .ok_or(DriverError::InvalidHandle { handle: kernel })?;
        state.queue(queue)?.push_back(Op::Launch {
            kernel,
            grid,
            block,
            args: args.to_vec(),
        });
        Ok(())
    }

    fn wait(&self, queue: Handle) -> Result<(), DriverError> {
        self.state.lock().drain(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> ReferenceDriver {
        ReferenceDriver::new("Test", 2, 1024).with_kernel("math", "store", |ctx| {
            let ptr = ctx.arg_u64(0)?;
            let value = ctx.arg_u64(8)? as i64;
            ctx.write_i64(ptr, value)
        })
    }

    #[test]
    fn test_queue_is_deferred_until_wait() {
        let driver = driver();
        let dev = driver.enumerate().unwrap()[0].handle;
        let queue = driver.create_queue(dev).unwrap();
        let buf = driver.mem_alloc(dev, 8, Residency::Device).unwrap();

        driver.enqueue_write(queue, buf, &7i64.to_ne_bytes()).unwrap();
        assert_eq!(driver.pending_commands(), 1);
        driver.wait(queue).unwrap();
        assert_eq!(driver.pending_commands(), 0);

        let mut out = [0u8; 8];
        driver.read(queue, buf, &mut out).unwrap();
        assert_eq!(i64::from_ne_bytes(out), 7);
    }

    #[test]
    fn test_module_kernel_launch() {
        let driver = driver();
        let dev = driver.enumerate().unwrap()[1].handle;
        let queue = driver.create_queue(dev).unwrap();
        let buf = driver.mem_alloc(dev, 8, Residency::Device).unwrap();

        let module = driver.load_module(dev, "math").unwrap();
        let kernel = driver.kernel(module, "store").unwrap();
        let mut args = buf.to_ne_bytes().to_vec();
        args.extend_from_slice(&42u64.to_ne_bytes());
        driver
            .enqueue_launch(queue, kernel, [1, 1, 1], [1, 1, 1], &args)
            .unwrap();

        let mut out = [0u8; 8];
        driver.read(queue, buf, &mut out).unwrap();
        assert_eq!(i64::from_ne_bytes(out), 42);

        assert!(matches!(
            driver.load_module(dev, "missing"),
            Err(DriverError::ModuleNotFound { .. })
        ));
        assert!(matches!(
            driver.kernel(module, "missing"),
            Err(DriverError::KernelNotFound { .. })
        ));
    }

    #[test]
    fn test_memory_limits_and_addresses() {
        let driver = driver();
        let dev = driver.enumerate().unwrap()[0].handle;
        let a = driver.mem_alloc(dev, 1000, Residency::Device).unwrap();
        assert_eq!(a % ADDRESS_ALIGN, 0);
        assert!(matches!(
            driver.mem_alloc(dev, 100, Residency::Device),
            Err(DriverError::OutOfMemory { size: 100 })
        ));
        driver.mem_free(a).unwrap();
        assert!(driver.mem_alloc(dev, 100, Residency::HostPinned).is_ok());
        assert!(driver.host_to_device_ptr(a).is_err());
        assert_eq!(
            driver.mem_free(a),
            Err(DriverError::InvalidAddress { address: a })
        );
    }

    #[test]
    fn test_failed_op_keeps_later_ops_queued() {
        let driver = driver().with_kernel("math", "fail", |_| {
            Err(DriverError::Backend("kernel fault".to_string()))
        });
        let dev = driver.enumerate().unwrap()[0].handle;
        let queue = driver.create_queue(dev).unwrap();
        let a = driver.mem_alloc(dev, 8, Residency::Device).unwrap();
        let b = driver.mem_alloc(dev, 8, Residency::Device).unwrap();
        driver.enqueue_write(queue, a, &[7u8; 8]).unwrap();
        driver.wait(queue).unwrap();

        let module = driver.load_module(dev, "math").unwrap();
        let fail = driver.kernel(module, "fail").unwrap();
        driver
            .enqueue_launch(queue, fail, [1, 1, 1], [1, 1, 1], &[])
            .unwrap();
        driver.enqueue_copy(queue, a, b, 8).unwrap();

        assert_eq!(
            driver.wait(queue),
            Err(DriverError::Backend("kernel fault".to_string()))
        );
        assert_eq!(driver.pending_commands(), 1);

        let mut out = [0u8; 8];
        driver.read(queue, b, &mut out).unwrap();
        assert_eq!(out, [7u8; 8]);
        assert_eq!(driver.pending_commands(), 0);
    }

    #[test]
    fn test_destroy_queue_runs_everything() {
        let driver = driver().with_kernel("math", "fail", |_| {
            Err(DriverError::Backend("kernel fault".to_string()))
        });
        let dev = driver.enumerate().unwrap()[0].handle;
        let queue = driver.create_queue(dev).unwrap();
        let buf = driver.mem_alloc(dev, 8, Residency::Device).unwrap();
        let module = driver.load_module(dev, "math").unwrap();
        let fail = driver.kernel(module, "fail").unwrap();
        driver
            .enqueue_launch(queue, fail, [1, 1, 1], [1, 1, 1], &[])
            .unwrap();
        driver.enqueue_write(queue, buf, &[1u8; 8]).unwrap();

        assert!(driver.destroy_queue(queue).is_err());
        assert_eq!(driver.live_queues(), 0);
        assert_eq!(driver.pending_commands(), 0);
    }

    #[test]
    fn test_huge_allocation_is_out_of_memory() {
        let driver = driver();
        let dev = driver.enumerate().unwrap()[0].handle;
        driver.mem_alloc(dev, 16, Residency::Device).unwrap();
        assert_eq!(
            driver.mem_alloc(dev, usize::MAX, Residency::Device),
            Err(DriverError::OutOfMemory { size: usize::MAX })
        );
    }
}
