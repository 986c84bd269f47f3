//! Kernel-side servers
//!
//! - Bootstrap: service name registration, lookup and namespace subsets

pub mod bootstrap;

pub use bootstrap::{service_name, BootstrapServer, ServiceName, BOOTSTRAP_NAME_MAX};
