//! Registration state tracking.
//!
//! Each service identity moves through
//!
//! ```text
//! Unregistered ──► Registering ──► Registered ──► Unregistering ──► Unregistered
//!                       │                               │
//!                       ▼                               ▼
//!                 Unregistered                 UnregistrationFailed
//!             (RegistrationFailed
//!              on the stream)
//! ```
//!
//! Only identities with a pending or live announcement are tracked. A failed
//! registration is reported on its stream and forgotten. A failed
//! unregistration keeps the backend control handle, so the caller can retry.
//!
//! The publisher behind all registrations is a session of its own: every
//! registration in flight or live holds one reference, and the publisher
//! closes when the last one ends.

use crate::backend::{
    RegisterOutcome, RegisterReply, RegistrationBackend, ServicePublisher, UnregisterOutcome,
    UnregisterReply, ABANDONED_REPLY,
};
use crate::scope::CallerScope;
use crate::session::{ManagedSession, SessionFactory, SessionKey, SessionManager};
use beacon_core::{BeaconError, Event, Result, ServiceDescriptor, ServiceIdentity};
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Control<B> = <<B as RegistrationBackend>::Publisher as ServicePublisher>::Registration;

const PUBLISHER_KEY: &str = "publisher";

/// Lifecycle state of one service identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    UnregistrationFailed,
}

impl RegistrationState {
    /// States in which the identity owns a live or pending announcement.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RegistrationState::Registering
                | RegistrationState::Registered
                | RegistrationState::Unregistering
                | RegistrationState::UnregistrationFailed
        )
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
            RegistrationState::Unregistering => "unregistering",
            RegistrationState::UnregistrationFailed => "unregistration failed",
        };
        f.write_str(name)
    }
}

/// The publisher session: one open publisher shared by every registration.
pub struct PublisherSession<B: RegistrationBackend> {
    publisher: B::Publisher,
}

impl<B: RegistrationBackend> PublisherSession<B> {
    pub fn publisher(&self) -> &B::Publisher {
        &self.publisher
    }
}

impl<B: RegistrationBackend> ManagedSession for PublisherSession<B> {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.publisher.close()
    }
}

pub struct PublisherSessions<B> {
    backend: Arc<B>,
}

impl<B: RegistrationBackend> SessionFactory for PublisherSessions<B> {
    type Session = PublisherSession<B>;

    fn create(&self, _key: &SessionKey) -> Result<PublisherSession<B>> {
        Ok(PublisherSession {
            publisher: self.backend.open_publisher()?,
        })
    }
}

struct Tracked<B: RegistrationBackend> {
    state: RegistrationState,
    service: ServiceDescriptor,
    control: Option<Arc<Control<B>>>,
    publisher: Option<Arc<PublisherSession<B>>>,
}

struct Inner<B: RegistrationBackend> {
    entries: DashMap<ServiceIdentity, Tracked<B>>,
    publishers: SessionManager<PublisherSessions<B>>,
}

impl<B: RegistrationBackend> Inner<B> {
    fn publisher_key() -> SessionKey {
        SessionKey::registration(PUBLISHER_KEY)
    }

    fn release_publisher(&self) {
        if let Err(e) = self.publishers.release(&Self::publisher_key()) {
            warn!(error = %e, "Publisher release failed");
        }
    }

    fn registration_done(&self, identity: &ServiceIdentity, outcome: RegisterOutcome) -> Result<Event> {
        match outcome {
            RegisterOutcome::Registered(service) => {
                if let Some(mut tracked) = self.entries.get_mut(identity) {
                    if tracked.state == RegistrationState::Registering {
                        tracked.state = RegistrationState::Registered;
                        tracked.service = service.clone();
                    }
                }
                info!(service = %identity, "Service registered");
                Ok(Event::Registered(service))
            }
            RegisterOutcome::Failed(code) => {
                let forgotten = self.entries.remove(identity);
                drop(forgotten);
                self.release_publisher();
                let error = BeaconError::registration_failed(identity.to_string(), code);
                warn!(%error, "Registration failed");
                Err(error)
            }
        }
    }

    fn unregistration_done(&self, identity: &ServiceIdentity, outcome: UnregisterOutcome) -> Result<Event> {
        match outcome {
            UnregisterOutcome::Unregistered(service) => {
                self.entries.remove(identity);
                self.release_publisher();
                info!(service = %identity, "Service unregistered");
                Ok(Event::Unregistered(service))
            }
            UnregisterOutcome::Failed(code) => {
                if let Some(mut tracked) = self.entries.get_mut(identity) {
                    tracked.state = RegistrationState::UnregistrationFailed;
                }
                let error = BeaconError::unregistration_failed(identity.to_string(), code);
                warn!(%error, "Unregistration failed, registration kept");
                Err(error)
            }
        }
    }
}

/// A registration waiting for its outcome. Taken exactly once, either by the
/// backend's reply or by the tracker when the backend rejects the request
/// outright.
struct PendingRegistration<B: RegistrationBackend> {
    identity: ServiceIdentity,
    inner: Weak<Inner<B>>,
    tx: oneshot::Sender<Result<Event>>,
}

impl<B: RegistrationBackend> PendingRegistration<B> {
    fn complete(self, outcome: RegisterOutcome) {
        let Some(inner) = self.inner.upgrade() else {
            debug!(service = %self.identity, "Tracker gone, dropping registration outcome");
            return;
        };
        let result = inner.registration_done(&self.identity, outcome);
        let _ = self.tx.send(result);
    }
}

/// Tracks local service announcements by identity.
pub struct RegistrationTracker<B: RegistrationBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: RegistrationBackend> Clone for RegistrationTracker<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: RegistrationBackend> RegistrationTracker<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                publishers: SessionManager::new(PublisherSessions { backend }),
            }),
        }
    }

    /// Announces a service. The returned stream yields exactly one item:
    /// `Registered(service)` or a `RegistrationFailed` error.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the descriptor cannot be announced, when the
    /// identity already has an active registration, or when the publisher
    /// cannot be opened or rejects the request.
    pub fn register(&self, service: &ServiceDescriptor) -> Result<OneShot> {
        service.validate_for_registration()?;
        let identity = service.identity();

        match self.inner.entries.entry(identity.clone()) {
            MapEntry::Occupied(occupied) => {
                debug!(service = %identity, state = %occupied.get().state, "Registration already active");
                return Err(BeaconError::AlreadyRegistered {
                    service: identity.to_string(),
                });
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Tracked {
                    state: RegistrationState::Registering,
                    service: service.clone(),
                    control: None,
                    publisher: None,
                });
            }
        }

        let publisher = match self.inner.publishers.acquire(&Inner::<B>::publisher_key()) {
            Ok(publisher) => publisher,
            Err(e) => {
                self.inner.entries.remove(&identity);
                return Err(e);
            }
        };
        if let Some(mut tracked) = self.inner.entries.get_mut(&identity) {
            tracked.publisher = Some(publisher.clone());
        }

        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(Mutex::new(Some(PendingRegistration {
            identity: identity.clone(),
            inner: Arc::downgrade(&self.inner),
            tx,
        })));

        let from_reply = pending.clone();
        let reply = RegisterReply::new(identity.to_string(), move |outcome| {
            if let Some(pending) = from_reply.lock().take() {
                pending.complete(outcome);
            }
        });

        debug!(service = %identity, "Registering service");
        match publisher.publisher().register(service, reply) {
            Ok(control) => {
                self.attach_control(&identity, control);
                Ok(OneShot::new(identity.to_string(), rx))
            }
            Err(e) => {
                warn!(service = %identity, error = %e, "Publisher rejected registration");
                let unanswered = pending.lock().take();
                if let Some(pending) = unanswered {
                    pending.complete(RegisterOutcome::Failed(ABANDONED_REPLY));
                }
                Err(e)
            }
        }
    }

    /// Withdraws a registered service. The returned stream yields exactly one
    /// item: `Unregistered(service)` or an `UnregistrationFailed` error.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::NotRegistered`] unless the identity is
    /// registered (or a previous unregistration of it failed).
    pub fn unregister(&self, service: &ServiceDescriptor) -> Result<OneShot> {
        let identity = service.identity();
        let not_registered = || BeaconError::NotRegistered {
            service: identity.to_string(),
        };

        let (control, publisher) = {
            let mut tracked = self.inner.entries.get_mut(&identity).ok_or_else(not_registered)?;
            if !matches!(
                tracked.state,
                RegistrationState::Registered | RegistrationState::UnregistrationFailed
            ) {
                return Err(not_registered());
            }
            let (Some(control), Some(publisher)) = (tracked.control.clone(), tracked.publisher.clone()) else {
                return Err(not_registered());
            };
            tracked.state = RegistrationState::Unregistering;
            (control, publisher)
        };

        let (tx, rx) = oneshot::channel();
        let inner = Arc::downgrade(&self.inner);
        let reply_identity = identity.clone();
        let reply = UnregisterReply::new(identity.to_string(), move |outcome| {
            let Some(inner) = inner.upgrade() else {
                debug!(service = %reply_identity, "Tracker gone, dropping unregistration outcome");
                return;
            };
            let _ = tx.send(inner.unregistration_done(&reply_identity, outcome));
        });

        debug!(service = %identity, "Unregistering service");
        publisher.publisher().unregister(&control, reply);
        Ok(OneShot::new(identity.to_string(), rx))
    }

    /// [`register`](Self::register) on behalf of `scope`.
    pub fn register_scoped(&self, scope: &CallerScope, service: &ServiceDescriptor) -> Result<OneShot> {
        scope.ensure_valid()?;
        self.register(service)
    }

    /// [`unregister`](Self::unregister) on behalf of `scope`.
    pub fn unregister_scoped(&self, scope: &CallerScope, service: &ServiceDescriptor) -> Result<OneShot> {
        scope.ensure_valid()?;
        self.unregister(service)
    }

    /// Current state of an identity. Unknown identities are `Unregistered`.
    pub fn state(&self, identity: &ServiceIdentity) -> RegistrationState {
        self.inner
            .entries
            .get(identity)
            .map_or(RegistrationState::Unregistered, |tracked| tracked.state)
    }

    /// Services currently announced, including those whose withdrawal failed.
    pub fn registered(&self) -> Vec<ServiceDescriptor> {
        let mut services: Vec<_> = self
            .inner
            .entries
            .iter()
            .filter(|tracked| {
                matches!(
                    tracked.state,
                    RegistrationState::Registered | RegistrationState::UnregistrationFailed
                )
            })
            .map(|tracked| tracked.service.clone())
            .collect();
        services.sort_by(|a, b| a.identity().cmp(&b.identity()));
        services
    }

    /// Whether the shared publisher is open.
    pub fn publisher_open(&self) -> bool {
        self.inner.publishers.is_live(&Inner::<B>::publisher_key())
    }

    fn attach_control(&self, identity: &ServiceIdentity, control: Control<B>) {
        match self.inner.entries.get_mut(identity) {
            Some(mut tracked)
                if matches!(
                    tracked.state,
                    RegistrationState::Registering | RegistrationState::Registered
                ) =>
            {
                tracked.control = Some(Arc::new(control));
            }
            _ => debug!(service = %identity, "Registration already failed, discarding control handle"),
        }
    }
}

/// Single-result stream for a registration or unregistration.
pub struct OneShot {
    service: String,
    rx: Option<oneshot::Receiver<Result<Event>>>,
}

impl OneShot {
    fn new(service: String, rx: oneshot::Receiver<Result<Event>>) -> Self {
        Self {
            service,
            rx: Some(rx),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Waits for the single outcome.
    pub async fn outcome(mut self) -> Result<Event> {
        match self.next().await {
            Some(result) => result,
            None => Err(BeaconError::Internal(format!(
                "outcome for '{}' already taken",
                self.service
            ))),
        }
    }
}

impl fmt::Debug for OneShot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShot")
            .field("service", &self.service)
            .field("finished", &self.rx.is_none())
            .finish()
    }
}

impl Stream for OneShot {
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(None);
        };

        let item = match Pin::new(rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(BeaconError::Internal(format!(
                "outcome for '{}' was never delivered",
                this.service
            ))),
        };
        this.rx = None;
        Poll::Ready(Some(item))
    }
}
