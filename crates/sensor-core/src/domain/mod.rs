//! Domain layer: device catalog, sensor buffers and the buffer registry.

pub mod buffer;
pub mod catalog;
pub(crate) mod segment;
pub mod store;
