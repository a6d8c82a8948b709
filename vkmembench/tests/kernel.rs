//! Runs the buffer device address kernel on a real device. Needs the
//! SPIR-V produced by `cargo xtask build`; returns early when that file or
//! a usable device is missing.

use std::path::PathBuf;
use std::sync::Arc;

use vkmem::buffer::AllocateBufferError;
use vkmem::device::DeviceContext;
use vkmembench::kernel::{INPUT_PATTERN, KERNEL_BYTES, run_copy_kernel, run_kernel_demo};

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

/// `out/vkmembench/<profile>/shaders/copy_words.spv`, either profile.
fn compiled_kernel() -> Option<PathBuf> {
    let out = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("out")
        .join("vkmembench");
    let found = ["debug", "release"]
        .iter()
        .map(|profile| out.join(profile).join("shaders").join("copy_words.spv"))
        .find(|path| path.is_file());
    if found.is_none() {
        eprintln!("skipping: run `cargo xtask build` to compile copy_words.spv");
    }
    found
}

fn no_host_coherent_memory(e: &eyre::Report) -> bool {
    e.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<AllocateBufferError>(),
            Some(AllocateBufferError::NoSuitableMemory(_))
        )
    })
}

#[test]
fn kernel_copies_the_pattern_into_zeroed_buffer() {
    let Some(shader) = compiled_kernel() else { return };
    let Some(ctx) = context() else { return };

    let run = match run_copy_kernel(&ctx, &shader) {
        Ok(run) => run,
        Err(e) if no_host_coherent_memory(&e) => {
            eprintln!("skipping: {e:#}");
            return;
        }
        Err(e) => panic!("kernel run failed: {e:#}"),
    };

    assert_eq!(run.input.len(), KERNEL_BYTES as usize);
    assert_eq!(run.output.len(), KERNEL_BYTES as usize);
    assert!(run.input.iter().all(|&b| b == INPUT_PATTERN));
    assert_eq!(run.first_mismatch(), None);
    assert_eq!(run.output[0], 0x80);
}

#[test]
fn demo_succeeds_with_compiled_kernel() {
    let Some(shader) = compiled_kernel() else { return };
    let Some(ctx) = context() else { return };

    match run_kernel_demo(&ctx, &shader) {
        Ok(()) => {}
        Err(e) if no_host_coherent_memory(&e) => eprintln!("skipping: {e:#}"),
        Err(e) => panic!("kernel demo failed: {e:#}"),
    }
}

#[test]
fn missing_shader_is_an_error() {
    let Some(ctx) = context() else { return };
    let missing = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("shaders")
        .join("does_not_exist.spv");

    match run_copy_kernel(&ctx, &missing) {
        Ok(_) => panic!("loaded a shader that does not exist"),
        Err(e) if no_host_coherent_memory(&e) => eprintln!("skipping: {e:#}"),
        Err(e) => assert!(format!("{e:#}").contains("Loading kernel shader")),
    }
}
