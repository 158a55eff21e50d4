//! mDNS backend for Beacon
//!
//! Implements the discovery and registration adapter traits over the
//! `mdns-sd` crate, which provides RFC 6762 (Multicast DNS) and RFC 6763
//! (DNS-SD) support without a system responder.
//!
//! - Each browse session gets its own [`mdns_sd::ServiceDaemon`] and a pump
//!   thread that forwards found/resolved/removed events.
//! - All registrations share one daemon, opened with the first registration
//!   and shut down after the last one is withdrawn.
//!
//! # Example
//!
//! ```no_run
//! use beacon_core::DiscoverySettings;
//! use beacon_discovery::Beacon;
//! use beacon_mdns::MdnsBackend;
//! use std::sync::Arc;
//!
//! # async fn run() -> beacon_core::Result<()> {
//! let settings = DiscoverySettings::default();
//! let beacon = Beacon::new(Arc::new(MdnsBackend::new(&settings)), &settings);
//! let _printers = beacon.browse("_ipp._tcp")?;
//! # Ok(())
//! # }
//! ```

pub mod browser;
pub mod error;
pub mod publisher;

pub use browser::MdnsBrowser;
pub use error::codes;
pub use publisher::{MdnsPublisher, MdnsRegistration};

use beacon_core::{DiscoverySettings, Result};
use beacon_discovery::{DiscoveryBackend, RegistrationBackend};
use tracing::debug;

/// Backend over `mdns-sd`.
#[derive(Debug, Clone)]
pub struct MdnsBackend {
    domain: String,
    host_name: String,
}

impl MdnsBackend {
    pub fn new(settings: &DiscoverySettings) -> Self {
        let host_name = publisher::announced_host_name(settings.host_name.as_deref(), &settings.domain);
        debug!(domain = %settings.domain, host = %host_name, "mDNS backend configured");
        Self {
            domain: settings.domain.clone(),
            host_name,
        }
    }

    /// Host name announced for registrations (e.g. "kiosk.local.").
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl DiscoveryBackend for MdnsBackend {
    type Browser = MdnsBrowser;

    fn open_browser(&self, service_type: &str) -> Result<MdnsBrowser> {
        MdnsBrowser::open(service_type, &self.domain)
    }
}

impl RegistrationBackend for MdnsBackend {
    type Publisher = MdnsPublisher;

    fn open_publisher(&self) -> Result<MdnsPublisher> {
        MdnsPublisher::open(&self.host_name, &self.domain)
    }
}
