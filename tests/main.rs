// Device-level smoke tests.
//
// These exercise a real Vulkan driver and are ignored by default;
// run them with `cargo test -- --ignored` on a machine with a
// working ICD. Presentation paths need a window system on top and
// live in applications, not here.

extern crate stratus;

use stratus::*;

fn make_device() -> Device {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut instance = Instance::create(Api::Vulkan).unwrap();
    instance
        .initialize(
            &AppInfo {
                app_name: "stratus-tests".into(),
                engine_name: "stratus".into(),
                app_version: 0,
                engine_version: 0,
            },
            LayerFlags::DEBUG_VALIDATION,
        )
        .unwrap();

    let adapters = instance.adapters().unwrap();
    assert!(!adapters.is_empty(), "no vulkan adapters present");
    adapters[0]
        .create_device(&DeviceCreateInfo::default())
        .unwrap()
}

fn staging_buffer_desc(size: u64) -> GraphicsResourceDescription {
    GraphicsResourceDescription {
        name: Some("test-staging".into()),
        dimension: ResourceDimension::Buffer,
        width: size,
        usage: ResourceUsage::COPY_SOURCE | ResourceUsage::COPY_DESTINATION,
        memory_usage: ResourceMemoryUsage::CpuToGpu,
        ..Default::default()
    }
}

#[test]
fn other_apis_are_not_implemented() {
    assert!(matches!(
        Instance::create(Api::D3d12),
        Err(StratusError::NO_IMPL)
    ));
    assert!(matches!(
        Instance::create(Api::D3d11),
        Err(StratusError::NO_IMPL)
    ));
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn map_write_unmap_round_trip() {
    let device = make_device();

    let buffer = device
        .create_resource(&staging_buffer_desc(1024), ResourceState::CopySource)
        .unwrap();

    let payload: Vec<u8> = (0..64u8).collect();
    let range = MapRange {
        offset_bytes: 0,
        size_bytes: 64,
    };
    let ptr = buffer.map(Some(&range)).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len()) };
    buffer.unmap(Some(&range)).unwrap();

    // Read back through a second mapping.
    let ptr = buffer.map(Some(&range)).unwrap();
    let read = unsafe { std::slice::from_raw_parts(ptr, payload.len()) };
    assert_eq!(read, payload.as_slice());

    device.destroy_resource(&buffer, true).unwrap();
    device.wait_idle();
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn view_descriptions_are_cached_per_resource() {
    let device = make_device();

    let image = device
        .create_resource(
            &GraphicsResourceDescription {
                name: Some("test-target".into()),
                dimension: ResourceDimension::Dim2d,
                width: 256,
                height: 256,
                format: ResourceFormat::B8G8R8A8Unorm,
                usage: ResourceUsage::RENDER_TARGET | ResourceUsage::SHADER_RESOURCE,
                ..Default::default()
            },
            ResourceState::RenderTarget,
        )
        .unwrap();

    let desc = ResourceViewDescription {
        view_type: ResourceViewType::RenderTarget,
        dimension: ResourceViewDimension::Dim2d,
        format: ResourceFormat::B8G8R8A8Unorm,
        ..Default::default()
    };
    let a = image.as_view(&desc).unwrap();
    let b = image.as_view(&desc).unwrap();
    assert_eq!(a, b);

    // A different description materializes a new view.
    let srv = ResourceViewDescription {
        view_type: ResourceViewType::ShaderResource,
        ..desc
    };
    let c = image.as_view(&srv).unwrap();
    assert_ne!(a, c);

    device.destroy_resource(&image, true).unwrap();
    device.wait_idle();
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn blocking_buffer_copy_moves_bytes() {
    let device = make_device();

    let src = device
        .create_resource(&staging_buffer_desc(256), ResourceState::CopySource)
        .unwrap();
    let dst = device
        .create_resource(&staging_buffer_desc(256), ResourceState::CopyDestination)
        .unwrap();

    let payload: Vec<u8> = (0..=255u8).collect();
    let ptr = src.map(None).unwrap();
    unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), ptr, payload.len()) };
    src.unmap(None).unwrap();
    // Copies are immediate submissions; push the coherency work now.
    match &device {
        Device::Vulkan(dev) => dev.flush_all_mapped_ranges(),
    }

    device
        .copy_buffer_regions(
            &dst,
            &src,
            &[CopyBufferRegion {
                src_offset_bytes: 0,
                dst_offset_bytes: 0,
                size_bytes: 256,
            }],
        )
        .unwrap();

    let ptr = dst.map(None).unwrap();
    let read = unsafe { std::slice::from_raw_parts(ptr, 256) };
    assert_eq!(read, payload.as_slice());

    device.destroy_resource(&src, true).unwrap();
    device.destroy_resource(&dst, true).unwrap();
    device.wait_idle();
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn deferred_destruction_survives_a_full_frame_ring() {
    let device = make_device();
    let mut context = device.create_context().unwrap();
    context.set_frames(3).unwrap();

    let buffer = device
        .create_resource(&staging_buffer_desc(864), ResourceState::CopyDestination)
        .unwrap();

    // Queue the free through the garbage ring; the memory must ride
    // out three frames and reclaim on the wrap without tripping the
    // validation layers.
    device.destroy_resource(&buffer, false).unwrap();

    for _ in 0..6 {
        context.begin().unwrap();
        context.end().unwrap();
    }

    context.wait();
    device.wait_idle();
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn push_pop_state_keeps_the_base_state() {
    let device = make_device();
    let mut context = device.create_context().unwrap();

    context.begin().unwrap();
    context.push_state(ContextFlags::INHERIT_PIPELINE_STATE);
    context.set_blend_enable(0, true);
    context.pop_state();
    // Popping at depth one stays a no-op.
    context.pop_state();
    context.pop_state();
    context.end().unwrap();

    context.wait();
}
