//! Backend adapter traits.
//!
//! A backend is the platform facility that actually speaks mDNS. Discovery
//! and registration are split so an adapter can implement only one side.
//!
//! Backends never talk to subscribers directly. Discovery callbacks go through
//! a [`DiscoverySink`]; registration outcomes go through one-shot
//! [`RegisterReply`] and [`UnregisterReply`] objects. Every callback may be
//! invoked from any thread and never blocks.

use crate::backlog::{ResolveBacklog, ResolveReply};
use crate::channel::EventChannel;
use beacon_core::{BeaconError, Event, Result, ServiceDescriptor};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Error code reported when a backend drops a registration reply unanswered.
pub const ABANDONED_REPLY: i32 = -1;

/// Creates one browser per discovery session.
pub trait DiscoveryBackend: Send + Sync + 'static {
    type Browser: ServiceBrowser;

    /// Opens the per-session browse handle for a normalized service type.
    fn open_browser(&self, service_type: &str) -> Result<Self::Browser>;
}

/// A browse handle for a single service type.
pub trait ServiceBrowser: Send + Sync + 'static {
    /// Backend reference to a found but unresolved service.
    type Entry: Clone + fmt::Debug + Send + Sync + 'static;

    /// Starts browsing. Results and failures are reported through `sink`.
    fn start_discovery(&self, sink: DiscoverySink<Self::Entry>) -> Result<()>;

    /// Resolves one entry. Exactly one resolution is outstanding at a time.
    fn resolve(&self, entry: Self::Entry, reply: ResolveReply);

    /// Stops browsing and releases the handle's resources.
    fn stop_discovery(&self) -> Result<()>;
}

/// Creates the publisher shared by all live registrations.
pub trait RegistrationBackend: Send + Sync + 'static {
    type Publisher: ServicePublisher;

    fn open_publisher(&self) -> Result<Self::Publisher>;
}

/// Announces and withdraws local services.
pub trait ServicePublisher: Send + Sync + 'static {
    /// Backend control handle for one announcement, needed to withdraw it.
    type Registration: Send + Sync + 'static;

    /// Starts announcing `service`. The outcome is reported through `reply`.
    ///
    /// Returning `Err` means the announcement never started; the reply must
    /// not be answered with success afterwards.
    fn register(&self, service: &ServiceDescriptor, reply: RegisterReply) -> Result<Self::Registration>;

    /// Withdraws an announcement. The outcome is reported through `reply`.
    fn unregister(&self, registration: &Self::Registration, reply: UnregisterReply);

    /// Releases the publisher once no registration is left.
    fn close(&self) -> Result<()>;
}

/// Callback surface handed to a browser when discovery starts.
pub struct DiscoverySink<E> {
    channel: Arc<EventChannel>,
    backlog: ResolveBacklog<E>,
}

impl<E> Clone for DiscoverySink<E> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            backlog: self.backlog.clone(),
        }
    }
}

impl<E> fmt::Debug for DiscoverySink<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySink")
            .field("session", &self.channel.label())
            .field("backlog", &self.backlog)
            .finish()
    }
}

impl<E> DiscoverySink<E>
where
    E: fmt::Debug + Clone + Send + 'static,
{
    pub(crate) fn new(channel: Arc<EventChannel>, backlog: ResolveBacklog<E>) -> Self {
        Self { channel, backlog }
    }

    /// Discovery could not start. Terminates the session's streams.
    pub fn start_failed(&self, code: i32) {
        self.channel
            .fail(BeaconError::start_failed(self.channel.label(), code));
    }

    /// Discovery could not stop. Terminates the session's streams.
    pub fn stop_failed(&self, code: i32) {
        self.channel
            .fail(BeaconError::stop_failed(self.channel.label(), code));
    }

    /// A service appeared. It is queued for resolution and only reported
    /// once resolved.
    pub fn service_found(&self, entry: E) {
        if self.is_closed() {
            debug!(session = %self.channel.label(), ?entry, "Ignoring stale found callback");
            return;
        }
        self.backlog.add(entry);
    }

    /// A service went away. Reported immediately, without resolution.
    pub fn service_lost(&self, service: ServiceDescriptor) {
        if self.is_closed() {
            debug!(session = %self.channel.label(), %service, "Ignoring stale lost callback");
            return;
        }
        self.channel.emit(Event::Removed(service));
    }

    /// True once the session behind this sink has been torn down.
    pub fn is_closed(&self) -> bool {
        self.backlog.is_quit()
    }
}

/// Outcome of a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(ServiceDescriptor),
    Failed(i32),
}

/// Outcome of an unregistration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnregisterOutcome {
    Unregistered(ServiceDescriptor),
    Failed(i32),
}

type Completion<O> = Box<dyn FnOnce(O) + Send>;

/// One-shot completion handle for [`ServicePublisher::register`].
///
/// Dropping it unanswered reports a failure with [`ABANDONED_REPLY`].
pub struct RegisterReply {
    service: String,
    complete: Option<Completion<RegisterOutcome>>,
}

impl RegisterReply {
    pub(crate) fn new(service: impl Into<String>, complete: impl FnOnce(RegisterOutcome) + Send + 'static) -> Self {
        Self {
            service: service.into(),
            complete: Some(Box::new(complete)),
        }
    }

    pub fn registered(mut self, service: ServiceDescriptor) {
        self.finish(RegisterOutcome::Registered(service));
    }

    pub fn failed(mut self, code: i32) {
        self.finish(RegisterOutcome::Failed(code));
    }

    /// Name of the service this reply belongs to.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn finish(&mut self, outcome: RegisterOutcome) {
        if let Some(complete) = self.complete.take() {
            complete(outcome);
        }
    }
}

impl fmt::Debug for RegisterReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterReply")
            .field("service", &self.service)
            .field("answered", &self.complete.is_none())
            .finish()
    }
}

impl Drop for RegisterReply {
    fn drop(&mut self) {
        if self.complete.is_some() {
            warn!(service = %self.service, "Register reply dropped without an answer");
            self.finish(RegisterOutcome::Failed(ABANDONED_REPLY));
        }
    }
}

/// One-shot completion handle for [`ServicePublisher::unregister`].
///
/// Dropping it unanswered reports a failure with [`ABANDONED_REPLY`].
pub struct UnregisterReply {
    service: String,
    complete: Option<Completion<UnregisterOutcome>>,
}

impl UnregisterReply {
    pub(crate) fn new(service: impl Into<String>, complete: impl FnOnce(UnregisterOutcome) + Send + 'static) -> Self {
        Self {
            service: service.into(),
            complete: Some(Box::new(complete)),
        }
    }

    pub fn unregistered(mut self, service: ServiceDescriptor) {
        self.finish(UnregisterOutcome::Unregistered(service));
    }

    pub fn failed(mut self, code: i32) {
        self.finish(UnregisterOutcome::Failed(code));
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn finish(&mut self, outcome: UnregisterOutcome) {
        if let Some(complete) = self.complete.take() {
            complete(outcome);
        }
    }
}

impl fmt::Debug for UnregisterReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnregisterReply")
            .field("service", &self.service)
            .field("answered", &self.complete.is_none())
            .finish()
    }
}

impl Drop for UnregisterReply {
    fn drop(&mut self) {
        if self.complete.is_some() {
            warn!(service = %self.service, "Unregister reply dropped without an answer");
            self.finish(UnregisterOutcome::Failed(ABANDONED_REPLY));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn printer() -> ServiceDescriptor {
        ServiceDescriptor::builder("printer", "_http._tcp")
            .port(8080)
            .build()
            .unwrap()
    }

    fn recorder<O: Send + 'static>() -> (Arc<Mutex<Vec<O>>>, impl FnOnce(O) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |o| sink.lock().push(o))
    }

    #[test]
    fn test_register_reply_answers_once() {
        let (seen, complete) = recorder();
        let reply = RegisterReply::new("printer", complete);
        assert_eq!(reply.service(), "printer");
        reply.registered(printer());

        assert_eq!(*seen.lock(), vec![RegisterOutcome::Registered(printer())]);
    }

    #[test]
    fn test_dropped_replies_report_abandoned() {
        let (seen, complete) = recorder();
        drop(RegisterReply::new("printer", complete));
        assert_eq!(*seen.lock(), vec![RegisterOutcome::Failed(ABANDONED_REPLY)]);

        let (seen, complete) = recorder();
        drop(UnregisterReply::new("printer", complete));
        assert_eq!(*seen.lock(), vec![UnregisterOutcome::Failed(ABANDONED_REPLY)]);
    }

    #[test]
    fn test_unregister_failure_code_is_forwarded() {
        let (seen, complete) = recorder();
        UnregisterReply::new("printer", complete).failed(5);
        assert_eq!(*seen.lock(), vec![UnregisterOutcome::Failed(5)]);
    }
}
