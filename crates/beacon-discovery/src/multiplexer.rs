//! Discovery event multiplexer.
//!
//! Any number of subscribers can browse the same service type. The first
//! subscription opens a browser and starts discovery; later ones attach to the
//! same broadcast channel and see live events from their subscription point
//! on. Dropping the last [`EventStream`] stops discovery.
//!
//! A session whose discovery failed is replaced by the next subscription. A
//! subscriber that falls more than `event_buffer` events behind gets
//! [`BeaconError::Lagged`] and its stream ends, so every subscriber still
//! running has seen the same events.

use crate::backend::{DiscoveryBackend, DiscoverySink, ServiceBrowser};
use crate::backlog::{ResolveBacklog, ResolveFn, ResolvedFn};
use crate::channel::{EventChannel, Signal};
use crate::scope::CallerScope;
use crate::session::{ManagedSession, SessionFactory, SessionGuard, SessionKey, SessionManager};
use beacon_core::types::parse_service_type;
use beacon_core::{BeaconError, Event, Result};
use futures::Stream;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

type Entry<B> = <<B as DiscoveryBackend>::Browser as ServiceBrowser>::Entry;

/// One running browse: the backend handle, its fan-out channel and its
/// resolve backlog.
pub struct DiscoverySession<B: DiscoveryBackend> {
    browser: Arc<B::Browser>,
    channel: Arc<EventChannel>,
    backlog: ResolveBacklog<Entry<B>>,
}

impl<B: DiscoveryBackend> DiscoverySession<B> {
    fn subscribe(&self) -> (broadcast::Receiver<Signal>, Option<BeaconError>) {
        self.channel.subscribe()
    }
}

impl<B: DiscoveryBackend> ManagedSession for DiscoverySession<B> {
    fn start(&self) -> Result<()> {
        let sink = DiscoverySink::new(self.channel.clone(), self.backlog.clone());
        if let Err(e) = self.browser.start_discovery(sink) {
            self.backlog.quit();
            return Err(e);
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let result = self.browser.stop_discovery();
        self.backlog.quit();
        result
    }

    fn is_failed(&self) -> bool {
        self.channel.has_failed()
    }
}

/// Builds a [`DiscoverySession`] per service type.
pub struct DiscoverySessions<B> {
    backend: Arc<B>,
    event_buffer: usize,
}

impl<B: DiscoveryBackend> SessionFactory for DiscoverySessions<B> {
    type Session = DiscoverySession<B>;

    fn create(&self, key: &SessionKey) -> Result<DiscoverySession<B>> {
        let service_type = key.key.clone();
        let browser = Arc::new(self.backend.open_browser(&service_type)?);
        let channel = Arc::new(EventChannel::new(service_type.clone(), self.event_buffer));

        let resolver = browser.clone();
        let resolve: ResolveFn<Entry<B>> = Arc::new(move |entry, reply| resolver.resolve(entry, reply));
        let emitter = channel.clone();
        let on_resolved: ResolvedFn = Arc::new(move |service| emitter.emit(Event::Added(service)));
        let backlog = ResolveBacklog::spawn(service_type.clone(), resolve, on_resolved)?;

        Ok(DiscoverySession {
            browser,
            channel,
            backlog,
        })
    }
}

/// Shares one discovery session per service type among all subscribers.
pub struct DiscoveryMultiplexer<B: DiscoveryBackend> {
    sessions: Arc<SessionManager<DiscoverySessions<B>>>,
}

impl<B: DiscoveryBackend> Clone for DiscoveryMultiplexer<B> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

impl<B: DiscoveryBackend> DiscoveryMultiplexer<B> {
    pub fn new(backend: Arc<B>, event_buffer: usize) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(DiscoverySessions {
                backend,
                event_buffer,
            })),
        }
    }

    /// Subscribes to `Added`/`Removed` events for a service type.
    ///
    /// `service_type` may carry a trailing `.local.`; it is normalized first.
    ///
    /// # Errors
    ///
    /// Fails synchronously on an invalid service type, or when a fresh session
    /// cannot be opened or started. Failures reported later by the backend
    /// arrive as the stream's last item.
    pub fn subscribe(&self, service_type: &str) -> Result<EventStream> {
        let service_type = parse_service_type(service_type)?;
        let key = SessionKey::discovery(service_type.clone());

        let (guard, (rx, failure)) = self.sessions.acquire_guarded(&key, DiscoverySession::subscribe)?;
        debug!(%service_type, refs = self.sessions.ref_count(&key), "Subscribed");

        Ok(EventStream::new(service_type, rx, failure, guard))
    }

    /// Subscribes on behalf of `scope`. An invalidated scope gets
    /// [`BeaconError::StaleCaller`] and no session is touched.
    pub fn subscribe_scoped(&self, scope: &CallerScope, service_type: &str) -> Result<EventStream> {
        if let Err(e) = scope.ensure_valid() {
            debug!(service_type, "Dropping subscription from stale caller");
            return Err(e);
        }
        self.subscribe(service_type)
    }

    /// Number of live subscriptions for a service type.
    pub fn subscriber_count(&self, service_type: &str) -> usize {
        self.key(service_type)
            .map_or(0, |key| self.sessions.ref_count(&key))
    }

    /// Whether discovery is running for a service type.
    pub fn is_active(&self, service_type: &str) -> bool {
        self.key(service_type)
            .is_some_and(|key| self.sessions.is_live(&key))
    }

    /// Generation of the running session for a service type.
    pub fn generation(&self, service_type: &str) -> Option<u64> {
        self.key(service_type)
            .and_then(|key| self.sessions.generation(&key))
    }

    fn key(&self, service_type: &str) -> Option<SessionKey> {
        parse_service_type(service_type)
            .ok()
            .map(SessionKey::discovery)
    }
}

/// Live discovery events for one service type.
///
/// Yields `Ok(event)` until the session fails, then a single `Err` and ends.
/// Dropping the stream unsubscribes.
pub struct EventStream {
    service_type: String,
    pending_failure: Option<BeaconError>,
    inner: BroadcastStream<Signal>,
    finished: bool,
    _guard: SessionGuard,
}

impl EventStream {
    fn new(
        service_type: String,
        rx: broadcast::Receiver<Signal>,
        pending_failure: Option<BeaconError>,
        guard: SessionGuard,
    ) -> Self {
        Self {
            service_type,
            pending_failure,
            inner: BroadcastStream::new(rx),
            finished: false,
            _guard: guard,
        }
    }

    /// Normalized service type this stream browses.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("service_type", &self.service_type)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Stream for EventStream {
    type Item = Result<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(error) = this.pending_failure.take() {
            this.finished = true;
            return Poll::Ready(Some(Err(error)));
        }

        let item = match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(Signal::Event(event))) => return Poll::Ready(Some(Ok(event))),
            Some(Ok(Signal::Failed(error))) => Some(Err(error)),
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                warn!(service_type = %this.service_type, skipped, "Subscriber fell behind, ending its stream");
                Some(Err(BeaconError::Lagged {
                    service_type: this.service_type.clone(),
                    skipped,
                }))
            }
            None => None,
        };
        this.finished = true;
        Poll::Ready(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::ResolveReply;
    use beacon_core::ServiceDescriptor;
    use futures::StreamExt;
    use parking_lot::Mutex;
    use std::time::Duration;

    type Sinks = Arc<Mutex<Vec<DiscoverySink<String>>>>;

    /// Browser that resolves every entry immediately.
    #[derive(Default)]
    struct InstantBackend {
        sinks: Sinks,
    }

    struct InstantBrowser {
        service_type: String,
        sinks: Sinks,
    }

    impl DiscoveryBackend for InstantBackend {
        type Browser = InstantBrowser;

        fn open_browser(&self, service_type: &str) -> Result<InstantBrowser> {
            Ok(InstantBrowser {
                service_type: service_type.to_string(),
                sinks: self.sinks.clone(),
            })
        }
    }

    impl ServiceBrowser for InstantBrowser {
        type Entry = String;

        fn start_discovery(&self, sink: DiscoverySink<String>) -> Result<()> {
            self.sinks.lock().push(sink);
            Ok(())
        }

        fn resolve(&self, entry: String, reply: ResolveReply) {
            reply.resolved(
                ServiceDescriptor::builder(entry, self.service_type.as_str())
                    .port(80)
                    .build()
                    .unwrap(),
            );
        }

        fn stop_discovery(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn next(stream: &mut EventStream) -> Option<Result<Event>> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_found_becomes_added() {
        let backend = Arc::new(InstantBackend::default());
        let mux = DiscoveryMultiplexer::new(backend.clone(), 16);

        let mut stream = mux.subscribe("_http._tcp.local.").unwrap();
        assert_eq!(stream.service_type(), "_http._tcp");
        assert!(mux.is_active("_http._tcp"));

        let sink = backend.sinks.lock()[0].clone();
        sink.service_found("printer".to_string());

        let event = next(&mut stream).await.unwrap().unwrap();
        assert_eq!(event, Event::Added(ServiceDescriptor::builder("printer", "_http._tcp").port(80).build().unwrap()));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_ended_not_skipped() {
        let backend = Arc::new(InstantBackend::default());
        let mux = DiscoveryMultiplexer::new(backend.clone(), 2);

        let mut fast = mux.subscribe("_http._tcp").unwrap();
        let mut slow = mux.subscribe("_http._tcp").unwrap();
        let sink = backend.sinks.lock()[0].clone();

        let mut fast_seen = Vec::new();
        for i in 0..4 {
            let name = format!("s{}", i);
            sink.service_lost(ServiceDescriptor::builder(name, "_http._tcp").build().unwrap());
            let event = next(&mut fast).await.unwrap().unwrap();
            fast_seen.push(event.service().name().to_string());
        }
        assert_eq!(fast_seen, ["s0", "s1", "s2", "s3"]);

        let err = next(&mut slow).await.unwrap().unwrap_err();
        assert_eq!(
            err,
            BeaconError::Lagged {
                service_type: "_http._tcp".to_string(),
                skipped: 2,
            }
        );
        assert!(err.is_terminal());
        assert!(next(&mut slow).await.is_none());

        // The lagging subscriber leaving does not disturb the others
        drop(slow);
        assert_eq!(mux.subscriber_count("_http._tcp"), 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_replaced_by_next_subscriber() {
        let backend = Arc::new(InstantBackend::default());
        let mux = DiscoveryMultiplexer::new(backend.clone(), 16);

        let mut failed = mux.subscribe("_http._tcp").unwrap();
        let first_generation = mux.generation("_http._tcp").unwrap();
        backend.sinks.lock()[0].start_failed(4);
        assert!(next(&mut failed).await.unwrap().is_err());

        let mut fresh = mux.subscribe("_http._tcp").unwrap();
        assert!(mux.generation("_http._tcp").unwrap() > first_generation);
        assert_eq!(backend.sinks.lock().len(), 2);
        assert!(backend.sinks.lock()[0].is_closed());

        // The terminated stream releasing its old session leaves the new one running
        drop(failed);
        assert!(mux.is_active("_http._tcp"));
        assert_eq!(mux.subscriber_count("_http._tcp"), 1);

        let sink = backend.sinks.lock()[1].clone();
        sink.service_found("printer".to_string());
        assert_eq!(next(&mut fresh).await.unwrap().unwrap().service().name(), "printer");
    }

    #[tokio::test]
    async fn test_start_failure_ends_stream() {
        let backend = Arc::new(InstantBackend::default());
        let mux = DiscoveryMultiplexer::new(backend.clone(), 16);

        let mut stream = mux.subscribe("_http._tcp").unwrap();
        backend.sinks.lock()[0].start_failed(4);

        let err = next(&mut stream).await.unwrap().unwrap_err();
        assert_eq!(err, BeaconError::start_failed("_http._tcp", 4));
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_type_and_stale_scope_are_rejected() {
        let backend = Arc::new(InstantBackend::default());
        let mux = DiscoveryMultiplexer::new(backend.clone(), 16);

        assert!(matches!(mux.subscribe("http"), Err(BeaconError::InvalidDescriptor(_))));

        let scope = CallerScope::new();
        scope.invalidate();
        assert!(matches!(
            mux.subscribe_scoped(&scope, "_http._tcp"),
            Err(BeaconError::StaleCaller)
        ));
        assert!(!mux.is_active("_http._tcp"));
        assert!(backend.sinks.lock().is_empty());
    }
}
