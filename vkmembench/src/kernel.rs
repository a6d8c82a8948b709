//! Buffer device address demo: a compute kernel copies 32 words between
//! two host-visible buffers it only knows by GPU address.

use std::path::Path;
use std::sync::Arc;

use eyre::{WrapErr, eyre};
use vkmem::ash::vk;
use vkmem::buffer::Buffer;
use vkmem::command::CommandBuffer;
use vkmem::device::DeviceContext;
use vkmem::pipeline::{ComputePipeline, PipelineLayout};
use vkmem::shader::ShaderModule;

pub const KERNEL_WORDS: u64 = 32;
pub const KERNEL_BYTES: vk::DeviceSize = KERNEL_WORDS * 4;
pub const INPUT_PATTERN: u8 = 0x80;
pub const ENTRY_POINT: &str = "main";

/// Push constant block of `copy_words.slang`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CopyWordsConstants {
    pub src: vk::DeviceAddress,
    pub dst: vk::DeviceAddress,
}

/// `" in = 0x80"` / `"out = 0x80"`.
pub fn byte_line(label: &str, byte: u8) -> String {
    format!("{label:>3} = {byte:#x}")
}

/// Index of the first byte that differs from `pattern`.
pub fn first_mismatch(bytes: &[u8], pattern: u8) -> Option<usize> {
    bytes.iter().position(|&b| b != pattern)
}

fn host_buffer(
    ctx: &Arc<DeviceContext>,
    usage: vk::BufferUsageFlags,
    fill: u8,
    name: &str,
) -> eyre::Result<Buffer> {
    let mut buffer = Buffer::new(
        ctx,
        KERNEL_BYTES,
        usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        Some(name),
    )
    .wrap_err_with(|| format!("Creating {name} buffer"))?;
    buffer
        .allocate(
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .wrap_err_with(|| format!("Allocating {name} buffer"))?;
    buffer
        .mmap()
        .wrap_err_with(|| format!("Mapping {name} buffer"))?
        .fill(fill);
    Ok(buffer)
}

/// Source and destination bytes after one kernel dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelRun {
    pub input: Vec<u8>,
    pub output: Vec<u8>,
}

impl KernelRun {
    /// Index of the first output byte that is not [`INPUT_PATTERN`].
    pub fn first_mismatch(&self) -> Option<usize> {
        first_mismatch(&self.output, INPUT_PATTERN)
    }
}

/// Dispatch the copy kernel once over a `0x80` source and a zeroed
/// destination and read both buffers back.
pub fn run_copy_kernel(
    ctx: &Arc<DeviceContext>,
    shader_path: &Path,
) -> eyre::Result<KernelRun> {
    let src = host_buffer(
        ctx,
        vk::BufferUsageFlags::TRANSFER_SRC,
        INPUT_PATTERN,
        "kernel source",
    )?;
    let dst = host_buffer(
        ctx,
        vk::BufferUsageFlags::TRANSFER_DST,
        0,
        "kernel destination",
    )?;

    // SAFETY: Both buffers were created with SHADER_DEVICE_ADDRESS usage.
    let constants = unsafe {
        CopyWordsConstants {
            src: src.device_address(),
            dst: dst.device_address(),
        }
    };
    tracing::debug!(
        "Kernel addresses: src {:#x}, dst {:#x}",
        constants.src,
        constants.dst
    );

    let layout = Arc::new(
        PipelineLayout::with_push_constants(
            ctx,
            std::mem::size_of::<CopyWordsConstants>() as u32,
        )
        .wrap_err("Creating kernel pipeline layout")?,
    );
    let pipeline = {
        let module = ShaderModule::from_file(ctx, shader_path)
            .wrap_err("Loading kernel shader")?;
        let entry_point = module.compute_entry_point(ENTRY_POINT)?;
        ComputePipeline::new(ctx, &entry_point, layout, Some("copy_words"))
            .wrap_err("Creating kernel pipeline")?
    };

    let mut commands = CommandBuffer::new(ctx, Some("kernel commands"))?;
    // SAFETY: Freshly allocated buffer. The pipeline and both buffers live
    // until after the fence wait below.
    unsafe {
        commands.begin()?;
        commands.bind_compute_pipeline(&pipeline);
        commands.push_constants(&pipeline, 0, &constants);
        commands.dispatch(1, 1, 1);
        commands.memory_barrier(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
            vk::PipelineStageFlags2::HOST,
            vk::AccessFlags2::HOST_READ,
        );
    }
    commands.end()?;

    let mut fence = ctx.create_fence()?;
    // SAFETY: See recording above.
    unsafe { commands.submit(&mut fence) }?;
    fence.wait()?;
    fence.reset()?;

    let input = src
        .mapped()
        .ok_or_else(|| eyre!("kernel source buffer is not mapped"))?;
    let output = dst
        .mapped()
        .ok_or_else(|| eyre!("kernel destination buffer is not mapped"))?;
    Ok(KernelRun {
        input: input.to_vec(),
        output: output.to_vec(),
    })
}

/// Run the copy kernel, print the first source and destination bytes and
/// check every destination byte.
pub fn run_kernel_demo(
    ctx: &Arc<DeviceContext>,
    shader_path: &Path,
) -> eyre::Result<()> {
    let _span = tracing::info_span!("kernel_demo").entered();

    let run = run_copy_kernel(ctx, shader_path)?;
    if let (Some(&input), Some(&output)) = (run.input.first(), run.output.first()) {
        println!("{}", byte_line("in", input));
        println!("{}", byte_line("out", output));
    }

    match run.first_mismatch() {
        None => Ok(()),
        Some(idx) => Err(eyre!(
            "kernel output byte {idx} is {:#x}, expected {INPUT_PATTERN:#x}",
            run.output[idx]
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_align_on_equals() {
        assert_eq!(byte_line("in", 0x80), " in = 0x80");
        assert_eq!(byte_line("out", 0x80), "out = 0x80");
        assert_eq!(byte_line("out", 0), "out = 0x0");
    }

    #[test]
    fn mismatch_reports_first_index() {
        let mut bytes = vec![INPUT_PATTERN; KERNEL_BYTES as usize];
        assert_eq!(first_mismatch(&bytes, INPUT_PATTERN), None);
        bytes[70] = 0;
        bytes[90] = 0;
        assert_eq!(first_mismatch(&bytes, INPUT_PATTERN), Some(70));
    }

    #[test]
    fn push_constants_are_two_addresses() {
        assert_eq!(std::mem::size_of::<CopyWordsConstants>(), 16);
        let c = CopyWordsConstants {
            src: 0x1000,
            dst: 0x2000,
        };
        let bytes = bytemuck::bytes_of(&c);
        assert_eq!(&bytes[..8], &0x1000u64.to_ne_bytes());
        assert_eq!(&bytes[8..], &0x2000u64.to_ne_bytes());
    }

    #[test]
    fn run_reports_first_bad_output_byte() {
        let mut run = KernelRun {
            input: vec![INPUT_PATTERN; KERNEL_BYTES as usize],
            output: vec![INPUT_PATTERN; KERNEL_BYTES as usize],
        };
        assert_eq!(run.first_mismatch(), None);
        run.output[127] = 0;
        assert_eq!(run.first_mismatch(), Some(127));
    }

    #[test]
    fn kernel_buffer_is_one_workgroup_of_words() {
        assert_eq!(KERNEL_BYTES, 128);
    }
}
