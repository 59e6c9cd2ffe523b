#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod error;
mod global;
mod pool;

pub use error::*;
pub use global::*;
pub use pool::*;
