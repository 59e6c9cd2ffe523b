#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod arg;
mod connection;
mod dispatch;
mod error;
mod global;
mod interface;
mod object;
mod queue;
mod transport;
mod wire;

pub use arg::*;
pub use connection::*;
pub use dispatch::*;
pub use error::*;
pub use global::*;
pub use interface::*;
pub use object::*;
pub use queue::*;
