//! # Beacon Core
//!
//! Core types, error handling, and configuration for the Beacon service
//! discovery library.
//!
//! This crate provides the foundational building blocks shared by the other
//! Beacon crates:
//!
//! - **Types**: [`ServiceDescriptor`] and its builder, the [`ServiceIdentity`]
//!   used to key registrations, and the [`Event`] envelope delivered to
//!   subscribers.
//! - **Errors**: [`BeaconError`] covers every failure a subscriber or a
//!   backend adapter can observe, from start failures to usage errors.
//! - **Configuration**: [`BeaconConfig`] loads from YAML files with
//!   environment variable overrides and validation.
//!
//! ## Example
//!
//! ```
//! use beacon_core::types::ServiceDescriptor;
//!
//! let printer = ServiceDescriptor::builder("printer", "_http._tcp.local.")
//!     .port(8080)
//!     .txt("path", "/queue")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(printer.service_type(), "_http._tcp");
//! assert_eq!(printer.fullname("local."), "printer._http._tcp.local.");
//! ```

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types for convenience
pub use config::{BeaconConfig, DiscoverySettings, LogFormat, LoggingConfig};
pub use error::{BeaconError, ConfigError, DescriptorError, Result};
pub use types::{Event, EventKind, ServiceDescriptor, ServiceDescriptorBuilder, ServiceIdentity};
