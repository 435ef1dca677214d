//! Infrastructure layer of the device service.
//!
//! Contains the OS-facing adapters: USB hotplug detection, serial packet
//! links, the Unix socket command/status transport, and config file loading.
//!
//! **Dependency rule**: `application` talks to this layer only through the
//! traits it defines (`PacketLink`, `LinkFactory`) and the ones it
//! implements (`StatusPublisher`).

pub mod hotplug;
pub mod link;
pub mod rpc;
pub mod storage;
