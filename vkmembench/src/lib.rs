//! The two measurements behind the `vkmembench` binary: the host-to-device
//! copy sweep ([`bench`]) and the buffer device address kernel
//! ([`kernel`]).

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod bench;
pub mod kernel;
