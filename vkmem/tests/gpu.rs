//! Tests that need a real Vulkan device with a dedicated
//! `COMPUTE | TRANSFER` queue family. Each test returns early when no such
//! device, or no memory type with the exact flags it needs, is available.

use std::sync::Arc;

use vkmem::ash::vk;
use vkmem::bandwidth::{BYTES_PER_MIB, BandwidthProbe, ProbeError, SOURCE_PATTERN};
use vkmem::buffer::{AllocateBufferError, Buffer};
use vkmem::command::{CommandBuffer, CommandBufferState, SubmitError};
use vkmem::device::DeviceContext;
use vkmem::query::{QueryResultsError, TimestampQueryPool};
use vkmem::sync::WaitFenceError;

fn context() -> Option<Arc<DeviceContext>> {
    // SAFETY: Loading the system Vulkan library is the point of these
    // tests.
    match unsafe { DeviceContext::new(None) } {
        Ok(ctx) => Some(Arc::new(ctx)),
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device: {e}");
            None
        }
    }
}

const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
        | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
);

fn host_buffer(
    ctx: &Arc<DeviceContext>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> Option<Buffer> {
    let mut buffer = ctx.create_buffer(size, usage).ok()?;
    match buffer.allocate(HOST_COHERENT) {
        Ok(()) => Some(buffer),
        Err(AllocateBufferError::NoSuitableMemory(_)) => {
            eprintln!("skipping: no memory type is exactly {HOST_COHERENT:?}");
            None
        }
        Err(e) => panic!("allocation failed: {e}"),
    }
}

#[test]
fn selected_queue_family_supports_timestamps_or_probe_refuses() {
    let Some(ctx) = context() else { return };
    if ctx.timestamp_valid_bits() == 0 {
        assert!(matches!(
            BandwidthProbe::new(&ctx, BYTES_PER_MIB),
            Err(ProbeError::TimestampsUnsupported)
        ));
    }
}

#[test]
fn mapped_writes_read_back() {
    let Some(ctx) = context() else { return };
    let Some(mut buffer) =
        host_buffer(&ctx, 4096, vk::BufferUsageFlags::TRANSFER_SRC)
    else {
        return;
    };

    assert!(buffer.is_allocated());
    assert!(buffer.mapped().is_none());

    let bytes = buffer.mmap().unwrap();
    assert_eq!(bytes.len(), 4096);
    bytes.fill(0x5a);
    assert!(buffer.is_mapped());
    assert!(buffer.mapped().unwrap().iter().all(|&b| b == 0x5a));

    buffer.munmap();
    assert!(!buffer.is_mapped());

    let bytes = buffer.mmap().unwrap();
    assert!(bytes.iter().all(|&b| b == 0x5a));
    buffer.munmap();
}

#[test]
fn fence_signals_only_after_submission() {
    let Some(ctx) = context() else { return };
    let mut fence = ctx.create_fence().unwrap();
    assert!(fence.is_ready());
    assert!(!fence.is_signaled().unwrap());
    assert!(matches!(fence.wait(), Err(WaitFenceError::NotSubmitted)));

    let mut commands = CommandBuffer::new(&ctx, None).unwrap();
    // SAFETY: Freshly allocated, never submitted.
    unsafe { commands.begin() }.unwrap();
    commands.end().unwrap();
    assert_eq!(commands.state(), CommandBufferState::Executable);

    // SAFETY: The buffer records no commands.
    unsafe { commands.submit(&mut fence) }.unwrap();
    fence.wait().unwrap();
    assert!(fence.is_signaled().unwrap());

    // Waiting again on a signaled fence returns immediately.
    fence.wait().unwrap();

    fence.reset().unwrap();
    assert!(fence.is_ready());
    assert!(!fence.is_signaled().unwrap());

    // Reusable after reset.
    // SAFETY: The previous submission has completed.
    unsafe { commands.submit(&mut fence) }.unwrap();
    fence.wait_and_reset().unwrap();
}

#[test]
fn submitting_unrecorded_buffer_fails() {
    let Some(ctx) = context() else { return };
    let mut fence = ctx.create_fence().unwrap();
    let commands = CommandBuffer::new(&ctx, None).unwrap();
    // SAFETY: Rejected before reaching the driver.
    let result = unsafe { commands.submit(&mut fence) };
    assert!(matches!(
        result,
        Err(SubmitError::NotExecutable(CommandBufferState::Initial))
    ));
    assert!(fence.is_ready());
}

#[test]
fn query_range_is_checked() {
    let Some(ctx) = context() else { return };
    let pool = TimestampQueryPool::new(&ctx, 2, None).unwrap();
    let mut out = [0u64; 3];
    assert!(matches!(
        pool.results(0, &mut out),
        Err(QueryResultsError::OutOfRange { .. })
    ));
}

#[test]
fn one_mib_probe_moves_the_pattern() {
    let Some(ctx) = context() else { return };
    let mut probe = match BandwidthProbe::new(&ctx, BYTES_PER_MIB) {
        Ok(probe) => probe,
        Err(ProbeError::AllocateBuffer(AllocateBufferError::NoSuitableMemory(
            flags,
        ))) => {
            eprintln!("skipping: no memory type is exactly {flags:?}");
            return;
        }
        Err(ProbeError::TimestampsUnsupported) => return,
        Err(e) => panic!("probe setup failed: {e}"),
    };

    let throughput = probe.measure_iterations(4).unwrap();
    assert_eq!(throughput.samples(), 4);
    assert_eq!(throughput.total_bytes(), 4 * BYTES_PER_MIB);
    assert!(throughput.total_seconds() > 0.0);
    assert!(throughput.mib_per_second().unwrap() > 0.0);

    assert!(
        probe.verify_destination().unwrap(),
        "destination does not hold {SOURCE_PATTERN:#x}"
    );
}
