//! Thin RAII wrappers over `ash` for a single-queue compute context, and
//! the copy bandwidth probe built on them.
//!
//! Everything starts from a [`DeviceContext`](device::DeviceContext)
//! behind an `Arc`. Buffers, fences, query pools, command buffers, shader
//! modules and pipelines each hold a clone of that `Arc`, so the device
//! outlives every object created from it.
//!
//! `vkmem` naming conventions:
//! - `raw_*` accessors return the Vulkan handle type from `ash::vk`.
//! - `ash_*` accessors return the corresponding `ash` wrapper object.
//! - `unsafe fn` methods on `DeviceContext` prefixed `create_raw_`,
//!   `destroy_raw_` and `cmd_` forward directly to the driver.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod bandwidth;
pub mod buffer;
pub mod command;
pub mod device;
pub mod instance;
pub mod log;
pub mod pipeline;
pub mod query;
pub mod shader;
pub mod sync;

pub use ash;
