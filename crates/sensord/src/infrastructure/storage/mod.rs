//! Storage infrastructure: the service configuration file.
//!
//! The `config` sub-module reads the TOML file named on the command line,
//! fills in defaults for anything missing, validates the values, and converts
//! them into the timing structs the application layer uses.

pub mod config;
