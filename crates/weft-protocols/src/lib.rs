#![doc = include_str!("../README.md")]

pub mod buffer;
pub mod callback;
pub mod compositor;
pub mod display;
mod glue;
pub mod registry;
pub mod shm;
pub mod shm_pool;
pub mod surface;

use weft_core::{Connection, Interface};

/// Every interface this crate describes, for bulk registration.
pub static ALL_INTERFACES: &[&Interface] = &[
    &display::INTERFACE,
    &callback::INTERFACE,
    &registry::INTERFACE,
    &compositor::INTERFACE,
    &surface::INTERFACE,
    &shm::INTERFACE,
    &shm_pool::INTERFACE,
    &buffer::INTERFACE,
];

/// Register every interface in this crate, making them resolvable for
/// dynamically-typed new-id arguments (registry binds).
pub fn register_all(conn: &Connection) {
    conn.register_interfaces(ALL_INTERFACES);
}
