//! Tests for the runtime registry: id partitioning, dispatch and staging.

use std::sync::Arc;

use hetrt::platform::{
    CpuPlatform, DeviceId, DriverPlatform, KernelArgs, KernelRef, LaunchParams, Platform,
    ReferenceDriver,
};
use hetrt::runtime::Runtime;
use hetrt::{PlatformError, Residency};

fn driver(name: &str, devices: usize) -> Arc<ReferenceDriver> {
    Arc::new(
        ReferenceDriver::new(name, devices, 1 << 20)
            .with_kernel("ops", "write_one", |ctx| {
                let ptr = ctx.arg_u64(0)?;
                ctx.write_i64(ptr, 1)
            })
            .with_kernel("ops", "add_one", |ctx| {
                let ptr = ctx.arg_u64(0)?;
                let value = ctx.read_i64(ptr)?;
                ctx.write_i64(ptr, value + 1)
            }),
    )
}

unsafe extern "C" fn write_one(args: *const u8, _x: u32, _y: u32, _z: u32) {
    let ptr = (args as *const u64).read_unaligned() as *mut i64;
    ptr.write(1);
}

unsafe extern "C" fn add_one(args: *const u8, _x: u32, _y: u32, _z: u32) {
    let ptr = (args as *const u64).read_unaligned() as *mut i64;
    ptr.write(ptr.read() + 1);
}

fn runtime() -> Runtime {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut runtime = Runtime::new();
    runtime.register(Box::new(CpuPlatform::new(3).unwrap()));
    runtime.register(Box::new(DriverPlatform::cuda(driver("Sim", 2)).unwrap()));
    runtime
}

#[test]
fn test_partitioning() {
    let mut runtime = Runtime::new();
    let p1 = runtime.register(Box::new(CpuPlatform::new(3).unwrap()));
    let p2 = runtime.register(Box::new(DriverPlatform::opencl(driver("Sim", 2)).unwrap()));

    assert_eq!(p1.iter().collect::<Vec<_>>(), vec![DeviceId(0), DeviceId(1), DeviceId(2)]);
    assert_eq!(p2.iter().collect::<Vec<_>>(), vec![DeviceId(3), DeviceId(4)]);
    assert_eq!(runtime.dev_count(), 5);

    for id in 0..3 {
        assert_eq!(runtime.platform_name(DeviceId(id)).unwrap(), "CPU");
    }
    for id in 3..5 {
        assert_eq!(runtime.platform_name(DeviceId(id)).unwrap(), "OpenCL");
    }
    assert_eq!(
        runtime.platform_name(DeviceId(5)),
        Err(PlatformError::InvalidDevice(DeviceId(5)))
    );

    let devices = runtime.devices().unwrap();
    assert_eq!(devices.len(), 5);
    assert_eq!(devices[4].local_index, 1);
    assert_eq!(devices[4].info.name, "Sim 1");
}

#[test]
fn test_round_trip_through_registry() {
    let runtime = runtime();
    for id in 0..runtime.dev_count() {
        let block = runtime.alloc(DeviceId(id), 128).unwrap();
        let input: Vec<u8> = (0..128u8).rev().collect();
        runtime.copy_from_host(&input, 0, &block, 0, 128).unwrap();

        let mut output = vec![0u8; 128];
        runtime.copy_to_host(&block, 0, &mut output, 0, 128).unwrap();
        assert_eq!(output, input);
        runtime.release(block).unwrap();
    }
}

#[test]
fn test_launch_ordering_on_cpu() {
    let runtime = runtime();
    let dev = DeviceId(1);
    let block = runtime.alloc(dev, 8).unwrap();
    let args = KernelArgs::new().push_ptr(block.ptr());

    runtime
        .launch_kernel(&LaunchParams::new(dev, KernelRef::Native(write_one)).args(args.clone()))
        .unwrap();
    runtime
        .launch_kernel(&LaunchParams::new(dev, KernelRef::Native(add_one)).args(args))
        .unwrap();
    runtime.synchronize(dev).unwrap();

    let mut out = [0u8; 8];
    runtime.copy_to_host(&block, 0, &mut out, 0, 8).unwrap();
    assert_eq!(i64::from_ne_bytes(out), 2);
    runtime.release(block).unwrap();
}

#[test]
fn test_launch_ordering_on_driver() {
    let runtime = runtime();
    let dev = DeviceId(4);
    let block = runtime.alloc(dev, 8).unwrap();
    let args = KernelArgs::new().push_ptr(block.ptr());

    for kernel in ["write_one", "add_one"] {
        runtime
            .launch_kernel(
                &LaunchParams::new(dev, KernelRef::module("ops", kernel)).args(args.clone()),
            )
            .unwrap();
    }
    runtime.synchronize_all().unwrap();

    let mut out = [0u8; 8];
    runtime.copy_to_host(&block, 0, &mut out, 0, 8).unwrap();
    assert_eq!(i64::from_ne_bytes(out), 2);
}

#[test]
fn test_cross_platform_copy_is_staged() {
    let runtime = runtime();
    let cpu = runtime.alloc(DeviceId(0), 16).unwrap();
    let gpu = runtime.alloc(DeviceId(3), 16).unwrap();
    let back = runtime.alloc(DeviceId(2), 16).unwrap();

    runtime.copy_from_host(&[7u8; 16], 0, &cpu, 0, 16).unwrap();
    runtime.copy(&cpu, 0, &gpu, 4, 12).unwrap();
    runtime.copy(&gpu, 0, &back, 0, 16).unwrap();
    runtime.synchronize_all().unwrap();

    let mut out = [0u8; 16];
    runtime.copy_to_host(&back, 0, &mut out, 0, 16).unwrap();
    assert_eq!(&out[..4], &[0u8; 4]);
    assert_eq!(&out[4..], &[7u8; 12]);

    assert!(matches!(
        runtime.copy(&cpu, 8, &gpu, 0, 16),
        Err(PlatformError::OutOfBounds { .. })
    ));
}

#[test]
fn test_release_routes_by_residency() {
    let runtime = runtime();
    for id in [DeviceId(0), DeviceId(3)] {
        let host = runtime.alloc_host(id, 8).unwrap();
        assert_eq!(host.residency(), Residency::HostPinned);
        assert!(runtime.get_device_ptr(&host).is_ok());
        runtime.release(host).unwrap();

        let unified = runtime.alloc_unified(id, 8).unwrap();
        assert_eq!(unified.size(), 8);
        runtime.release(unified).unwrap();
    }
}

#[test]
fn test_invalid_device_ids() {
    let runtime = runtime();
    assert_eq!(
        runtime.alloc(DeviceId(99), 8).unwrap_err(),
        PlatformError::InvalidDevice(DeviceId(99))
    );
    let params = LaunchParams::new(DeviceId(5), KernelRef::Native(write_one));
    assert_eq!(
        runtime.launch_kernel(&params),
        Err(PlatformError::InvalidDevice(DeviceId(5)))
    );
}

#[test]
fn test_shared_runtime_across_threads() {
    let runtime = Arc::new(runtime());
    std::thread::scope(|scope| {
        for id in 0..runtime.dev_count() {
            let runtime = Arc::clone(&runtime);
            scope.spawn(move || {
                let block = runtime.alloc(DeviceId(id), 64).unwrap();
                runtime.copy_from_host(&[id as u8; 64], 0, &block, 0, 64).unwrap();
                let mut out = [0u8; 64];
                runtime.copy_to_host(&block, 0, &mut out, 0, 64).unwrap();
                assert_eq!(out, [id as u8; 64]);
                runtime.release(block).unwrap();
            });
        }
    });
}

#[test]
fn test_platforms_are_object_safe() {
    let platforms: Vec<Box<dyn Platform>> = vec![
        Box::new(CpuPlatform::new(1).unwrap()),
        Box::new(DriverPlatform::hsa(driver("Sim", 1)).unwrap()),
    ];
    assert_eq!(platforms.iter().map(|p| p.dev_count()).sum::<usize>(), 2);
}
