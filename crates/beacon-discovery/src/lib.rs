//! Reactive mDNS/DNS-SD discovery and registration
//!
//! This crate turns a callback-driven discovery facility into streams:
//! - Browse a service type and receive `Added`/`Removed` events
//! - Share one underlying browse among any number of subscribers
//! - Announce and withdraw local services, one outcome per request
//!
//! # Architecture
//!
//! ```text
//!   subscribe(type) ──► DiscoveryMultiplexer ──► SessionManager ──► ServiceBrowser
//!        ▲                     │                                         │
//!        │               EventChannel ◄── Added ◄── ResolveBacklog ◄── found
//!   EventStream ◄──────────────┘  ◄────────────── Removed ◄──────────── lost
//!
//!   register(service) ──► RegistrationTracker ──► SessionManager ──► ServicePublisher
//!   OneShot ◄──────────────────┘ ◄────────────────── RegisterReply ◄──────┘
//! ```
//!
//! 1. The first subscriber for a service type creates a session: a browser,
//!    a broadcast channel and a resolve backlog. Later subscribers share it.
//! 2. Found services are resolved one at a time, in discovery order; only
//!    resolved services are emitted.
//! 3. Dropping the last stream stops the browse synchronously.
//!
//! Backends plug in through the traits in [`backend`]. The `beacon-mdns`
//! crate provides one built on `mdns-sd`.
//!
//! # Example
//!
//! ```no_run
//! use beacon_discovery::{Beacon, DiscoveryBackend, RegistrationBackend};
//! use beacon_core::DiscoverySettings;
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! async fn watch<B: DiscoveryBackend + RegistrationBackend>(backend: Arc<B>) -> beacon_core::Result<()> {
//!     let beacon = Beacon::new(backend, &DiscoverySettings::default());
//!     let mut printers = beacon.browse("_ipp._tcp")?;
//!
//!     while let Some(event) = printers.next().await {
//!         println!("{:?}", event?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod backlog;
mod channel;
pub mod multiplexer;
pub mod registration;
pub mod scope;
pub mod session;

pub use backend::{
    DiscoveryBackend, DiscoverySink, RegisterOutcome, RegisterReply, RegistrationBackend,
    ServiceBrowser, ServicePublisher, UnregisterOutcome, UnregisterReply, ABANDONED_REPLY,
};
pub use backlog::{ResolveBacklog, ResolveOutcome, ResolveReply};
pub use multiplexer::{DiscoveryMultiplexer, EventStream};
pub use registration::{OneShot, RegistrationState, RegistrationTracker};
pub use scope::CallerScope;
pub use session::{SessionKey, SessionKind};

use beacon_core::{DiscoverySettings, Result, ServiceDescriptor, ServiceIdentity};
use std::sync::Arc;
use tracing::info;

/// Discovery and registration over one backend.
pub struct Beacon<B>
where
    B: DiscoveryBackend + RegistrationBackend,
{
    discovery: DiscoveryMultiplexer<B>,
    registrations: RegistrationTracker<B>,
}

impl<B> Clone for Beacon<B>
where
    B: DiscoveryBackend + RegistrationBackend,
{
    fn clone(&self) -> Self {
        Self {
            discovery: self.discovery.clone(),
            registrations: self.registrations.clone(),
        }
    }
}

impl<B> Beacon<B>
where
    B: DiscoveryBackend + RegistrationBackend,
{
    pub fn new(backend: Arc<B>, settings: &DiscoverySettings) -> Self {
        info!(event_buffer = settings.event_buffer, "Beacon initialized");
        Self {
            discovery: DiscoveryMultiplexer::new(backend.clone(), settings.event_buffer),
            registrations: RegistrationTracker::new(backend),
        }
    }

    /// Browses a service type. See [`DiscoveryMultiplexer::subscribe`].
    pub fn browse(&self, service_type: &str) -> Result<EventStream> {
        self.discovery.subscribe(service_type)
    }

    pub fn browse_scoped(&self, scope: &CallerScope, service_type: &str) -> Result<EventStream> {
        self.discovery.subscribe_scoped(scope, service_type)
    }

    /// Announces a service. See [`RegistrationTracker::register`].
    pub fn register(&self, service: &ServiceDescriptor) -> Result<OneShot> {
        self.registrations.register(service)
    }

    pub fn register_scoped(&self, scope: &CallerScope, service: &ServiceDescriptor) -> Result<OneShot> {
        self.registrations.register_scoped(scope, service)
    }

    /// Withdraws a service. See [`RegistrationTracker::unregister`].
    pub fn unregister(&self, service: &ServiceDescriptor) -> Result<OneShot> {
        self.registrations.unregister(service)
    }

    pub fn unregister_scoped(&self, scope: &CallerScope, service: &ServiceDescriptor) -> Result<OneShot> {
        self.registrations.unregister_scoped(scope, service)
    }

    pub fn registration_state(&self, identity: &ServiceIdentity) -> RegistrationState {
        self.registrations.state(identity)
    }

    pub fn discovery(&self) -> &DiscoveryMultiplexer<B> {
        &self.discovery
    }

    pub fn registrations(&self) -> &RegistrationTracker<B> {
        &self.registrations
    }
}
