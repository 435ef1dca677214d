//! Application layer of the device service.
//!
//! Everything here talks to sensors through the [`PacketLink`] and
//! [`LinkFactory`] traits and publishes through [`StatusPublisher`], so the
//! protocol logic runs unchanged against serial ports or in-memory mocks.
//!
//! # Sub-modules
//!
//! - **`session`**      – The per-sensor protocol state machine: ping, read
//!   loop, write loop, round-trip timing, disable, teardown.
//!
//! - **`orchestrator`** – Owns the set of live sessions, turns hotplug events
//!   into sessions, broadcasts status and fans out commands.
//!
//! - **`command`**      – Named commands and the request/reply channel the
//!   command transport uses to reach the orchestrator.
//!
//! - **`status`**       – The status publishing seam.
//!
//! - **`retry`**        – Bounded retry with a constant backoff.
//!
//! [`PacketLink`]: crate::infrastructure::link::PacketLink
//! [`LinkFactory`]: crate::infrastructure::link::LinkFactory
//! [`StatusPublisher`]: status::StatusPublisher

pub mod command;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod status;
