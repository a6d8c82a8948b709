//! Host-to-device copy bandwidth measurement.
//!
//! A [`BandwidthProbe`] owns a host-visible source buffer, a device-local
//! destination buffer of the same size, a two-slot timestamp query pool, a
//! fence and one pre-recorded command buffer:
//!
//! ```text
//! reset queries 0..2
//! timestamp 0 (NONE)
//! copy src -> dst, whole buffer
//! timestamp 1 (COPY)
//! ```
//!
//! [`measure`](BandwidthProbe::measure) submits that buffer
//! [`MEASUREMENT_ITERATIONS`] times, waiting on the fence after every
//! submission, and sums the device time between the two timestamps. Each
//! iteration pays a full submit and wait round trip; nothing is pipelined.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::{AllocateBufferError, Buffer, CreateBufferError, MapBufferError};
use crate::command::{
    AllocateCommandBufferError, CommandBuffer, RecordCommandBufferError,
    SubmitError,
};
use crate::device::DeviceContext;
use crate::query::{CreateQueryPoolError, QueryResultsError, TimestampQueryPool};
use crate::sync::{CreateFenceError, Fence, ResetFenceError, WaitFenceError};

/// Submissions per [`BandwidthProbe::measure`] call.
pub const MEASUREMENT_ITERATIONS: u32 = 32;

/// Byte the source buffer is filled with.
pub const SOURCE_PATTERN: u8 = 0xff;

pub const BYTES_PER_MIB: u64 = 1 << 20;

const NANOS_PER_SECOND: f64 = 1e9;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("The compute queue does not support timestamps (0 valid bits)")]
    TimestampsUnsupported,

    #[error("Probe buffer size must be non-zero")]
    EmptyBuffer,

    #[error(transparent)]
    CreateBuffer(#[from] CreateBufferError),

    #[error(transparent)]
    AllocateBuffer(#[from] AllocateBufferError),

    #[error(transparent)]
    MapBuffer(#[from] MapBufferError),

    #[error(transparent)]
    CreateQueryPool(#[from] CreateQueryPoolError),

    #[error(transparent)]
    CreateFence(#[from] CreateFenceError),

    #[error(transparent)]
    AllocateCommandBuffer(#[from] AllocateCommandBufferError),

    #[error(transparent)]
    Record(#[from] RecordCommandBufferError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Wait(#[from] WaitFenceError),

    #[error(transparent)]
    Reset(#[from] ResetFenceError),

    #[error(transparent)]
    QueryResults(#[from] QueryResultsError),
}

/// Ticks elapsed from `t0` to `t1` on a counter with `valid_bits`
/// meaningful low bits. A counter that wrapped between the two samples
/// still yields the forward distance.
pub fn timestamp_delta(t0: u64, t1: u64, valid_bits: u32) -> u64 {
    let mask = if valid_bits >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << valid_bits) - 1
    };
    t1.wrapping_sub(t0) & mask
}

/// Convert timestamp ticks to seconds given the device's nanoseconds per
/// tick.
pub fn ticks_to_seconds(ticks: u64, period_ns: f32) -> f64 {
    ticks as f64 * f64::from(period_ns) / NANOS_PER_SECOND
}

/// Accumulated bytes moved and device time spent moving them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    total_bytes: u64,
    total_seconds: f64,
    samples: u32,
}

impl Throughput {
    pub fn record_sample(&mut self, bytes: u64, seconds: f64) {
        self.total_bytes += bytes;
        self.total_seconds += seconds;
        self.samples += 1;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_seconds
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// `None` until some device time has been recorded.
    pub fn bytes_per_second(&self) -> Option<f64> {
        (self.total_seconds > 0.0)
            .then(|| self.total_bytes as f64 / self.total_seconds)
    }

    pub fn mib_per_second(&self) -> Option<f64> {
        self.bytes_per_second()
            .map(|bps| bps / BYTES_PER_MIB as f64)
    }
}

/// Resources for timing one buffer size. See the module docs.
pub struct BandwidthProbe {
    // Dropped first: nothing may still reference the buffers.
    command_buffer: CommandBuffer,
    fence: Fence,
    queries: TimestampQueryPool,
    dst: Buffer,
    src: Buffer,
    size: vk::DeviceSize,
    timestamp_period: f32,
    timestamp_valid_bits: u32,
}

impl std::fmt::Debug for BandwidthProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandwidthProbe")
            .field("size", &self.size)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .finish_non_exhaustive()
    }
}

impl BandwidthProbe {
    /// Allocate the buffers, fill the source with [`SOURCE_PATTERN`] and
    /// record the timed copy.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        size: vk::DeviceSize,
    ) -> Result<Self, ProbeError> {
        let _span =
            tracing::debug_span!("bandwidth_probe_setup", size).entered();

        let timestamp_valid_bits = ctx.timestamp_valid_bits();
        if timestamp_valid_bits == 0 {
            return Err(ProbeError::TimestampsUnsupported);
        }
        if size == 0 {
            return Err(ProbeError::EmptyBuffer);
        }

        let mut src = Buffer::new(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Some("probe source"),
        )?;
        src.allocate(
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        src.mmap()?.fill(SOURCE_PATTERN);
        src.munmap();

        let mut dst = Buffer::new(
            ctx,
            size,
            vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC,
            Some("probe destination"),
        )?;
        dst.allocate(vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        let queries = TimestampQueryPool::new(ctx, 2, Some("probe timestamps"))?;
        let fence = Fence::new(ctx, Some("probe fence"))?;
        let mut command_buffer =
            CommandBuffer::new(ctx, Some("probe copy commands"))?;

        // SAFETY: The buffer is freshly allocated and never submitted. Every
        // object recorded is owned by the probe and outlives the buffer,
        // which is dropped first.
        unsafe {
            command_buffer.begin()?;
            command_buffer.reset_query_pool(&queries, 0, 2);
            command_buffer.write_timestamp(
                vk::PipelineStageFlags2::NONE,
                &queries,
                0,
            );
            command_buffer.copy_buffer(&src, &dst, size);
            command_buffer.write_timestamp(
                vk::PipelineStageFlags2::COPY,
                &queries,
                1,
            );
        }
        command_buffer.end()?;

        Ok(Self {
            command_buffer,
            fence,
            queries,
            dst,
            src,
            size,
            timestamp_period: ctx.timestamp_period(),
            timestamp_valid_bits,
        })
    }

    /// Time [`MEASUREMENT_ITERATIONS`] copies.
    pub fn measure(&mut self) -> Result<Throughput, ProbeError> {
        self.measure_iterations(MEASUREMENT_ITERATIONS)
    }

    /// Time `iterations` copies, one submit and wait round trip each.
    pub fn measure_iterations(
        &mut self,
        iterations: u32,
    ) -> Result<Throughput, ProbeError> {
        let _span = tracing::debug_span!(
            "bandwidth_probe_measure",
            size = self.size,
            iterations
        )
        .entered();

        let mut throughput = Throughput::default();
        for iteration in 0..iterations {
            // SAFETY: The previous submission, if any, has been waited on,
            // and all recorded objects live as long as self.
            unsafe { self.command_buffer.submit(&mut self.fence) }?;
            self.fence.wait()?;
            self.fence.reset()?;

            let mut timestamps = [0u64; 2];
            self.queries.results(0, &mut timestamps)?;
            let ticks = timestamp_delta(
                timestamps[0],
                timestamps[1],
                self.timestamp_valid_bits,
            );
            let seconds = ticks_to_seconds(ticks, self.timestamp_period);
            tracing::trace!(iteration, ticks, seconds, "copy timed");

            throughput.record_sample(self.size, seconds);
        }
        Ok(throughput)
    }

    /// Copy the destination back to a host-visible buffer and check every
    /// byte equals [`SOURCE_PATTERN`].
    ///
    /// Only meaningful after at least one measured copy.
    pub fn verify_destination(&mut self) -> Result<bool, ProbeError> {
        let ctx = Arc::clone(self.dst.parent());
        let mut readback = Buffer::new(
            &ctx,
            self.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            Some("probe readback"),
        )?;
        readback.allocate(
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let mut command_buffer =
            CommandBuffer::new(&ctx, Some("probe readback commands"))?;
        // SAFETY: Freshly allocated buffer; dst and readback outlive the
        // wait below.
        unsafe {
            command_buffer.begin()?;
            command_buffer.copy_buffer(&self.dst, &readback, self.size);
            command_buffer.memory_barrier(
                vk::PipelineStageFlags2::COPY,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::HOST,
                vk::AccessFlags2::HOST_READ,
            );
        }
        command_buffer.end()?;

        // SAFETY: Everything recorded lives until the wait returns.
        unsafe { command_buffer.submit(&mut self.fence) }?;
        self.fence.wait_and_reset()?;

        let matches = readback
            .mmap()?
            .iter()
            .all(|&byte| byte == SOURCE_PATTERN);
        readback.munmap();
        Ok(matches)
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}
