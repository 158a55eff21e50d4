//! Common test utilities and helpers for integration tests
//!
//! [`ScriptedBackend`] is an in-memory backend the tests drive by hand:
//! they trigger found/lost callbacks, answer resolutions one by one and
//! choose how registrations are answered.

#![allow(dead_code)]

use beacon_core::{BeaconError, Event, Result, ServiceDescriptor};
use beacon_discovery::{
    DiscoveryBackend, DiscoverySink, EventStream, RegisterReply, RegistrationBackend, ResolveReply,
    ServiceBrowser, ServicePublisher, UnregisterReply,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(2);

/// How the publisher answers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Answer with success before returning
    Immediate,
    /// Answer with a failure code before returning
    Fail(i32),
    /// Keep the reply for the test to answer
    Defer,
    /// Return an error from `register` without answering
    Reject,
}

#[derive(Default)]
pub struct Script {
    pub browsers_opened: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub resolves: AtomicUsize,
    pub sinks: Mutex<HashMap<String, DiscoverySink<String>>>,
    pub parked: Mutex<Vec<(String, ResolveReply)>>,
    pub start_error: Mutex<Option<i32>>,

    pub publishers_opened: AtomicUsize,
    pub closes: AtomicUsize,
    pub register_mode: Mutex<Option<ReplyMode>>,
    pub unregister_mode: Mutex<Option<ReplyMode>>,
    pub deferred_registers: Mutex<Vec<(ServiceDescriptor, RegisterReply)>>,
    pub next_token: AtomicU64,
    pub announced: Mutex<HashMap<u64, ServiceDescriptor>>,
}

#[derive(Clone, Default)]
pub struct ScriptedBackend {
    pub script: Arc<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn sink(&self, service_type: &str) -> DiscoverySink<String> {
        self.script
            .sinks
            .lock()
            .get(service_type)
            .cloned()
            .unwrap_or_else(|| panic!("discovery of {} was never started", service_type))
    }

    pub fn found(&self, service_type: &str, name: &str) {
        self.sink(service_type).service_found(name.to_string());
    }

    pub fn lost(&self, service_type: &str, name: &str) {
        self.sink(service_type)
            .service_lost(descriptor(name, service_type, 0));
    }

    pub fn start_failed(&self, service_type: &str, code: i32) {
        self.sink(service_type).start_failed(code);
    }

    pub fn stop_failed(&self, service_type: &str, code: i32) {
        self.sink(service_type).stop_failed(code);
    }

    /// Waits for the next resolve request.
    pub async fn next_resolve(&self) -> (String, ResolveReply) {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(item) = {
                    let mut parked = self.script.parked.lock();
                    (!parked.is_empty()).then(|| parked.remove(0))
                } {
                    return item;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("no resolve request dispatched")
    }

    pub fn parked_resolves(&self) -> usize {
        self.script.parked.lock().len()
    }

    pub fn set_register_mode(&self, mode: ReplyMode) {
        *self.script.register_mode.lock() = Some(mode);
    }

    pub fn set_unregister_mode(&self, mode: ReplyMode) {
        *self.script.unregister_mode.lock() = Some(mode);
    }

    pub fn take_deferred_register(&self) -> (ServiceDescriptor, RegisterReply) {
        self.script
            .deferred_registers
            .lock()
            .pop()
            .expect("no deferred registration")
    }

    pub fn starts(&self) -> usize {
        self.script.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.script.stops.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBrowser {
    service_type: String,
    script: Arc<Script>,
}

impl DiscoveryBackend for ScriptedBackend {
    type Browser = ScriptedBrowser;

    fn open_browser(&self, service_type: &str) -> Result<ScriptedBrowser> {
        self.script.browsers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedBrowser {
            service_type: service_type.to_string(),
            script: self.script.clone(),
        })
    }
}

impl ServiceBrowser for ScriptedBrowser {
    type Entry = String;

    fn start_discovery(&self, sink: DiscoverySink<String>) -> Result<()> {
        self.script.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *self.script.start_error.lock() {
            return Err(BeaconError::start_failed(self.service_type.as_str(), code));
        }
        self.script
            .sinks
            .lock()
            .insert(self.service_type.clone(), sink);
        Ok(())
    }

    fn resolve(&self, entry: String, reply: ResolveReply) {
        self.script.resolves.fetch_add(1, Ordering::SeqCst);
        self.script.parked.lock().push((entry, reply));
    }

    fn stop_discovery(&self) -> Result<()> {
        self.script.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedPublisher {
    script: Arc<Script>,
}

impl RegistrationBackend for ScriptedBackend {
    type Publisher = ScriptedPublisher;

    fn open_publisher(&self) -> Result<ScriptedPublisher> {
        self.script.publishers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedPublisher {
            script: self.script.clone(),
        })
    }
}

impl ServicePublisher for ScriptedPublisher {
    type Registration = u64;

    fn register(&self, service: &ServiceDescriptor, reply: RegisterReply) -> Result<u64> {
        let token = self.script.next_token.fetch_add(1, Ordering::SeqCst);
        let mode = self.script.register_mode.lock().unwrap_or(ReplyMode::Immediate);
        match mode {
            ReplyMode::Immediate => {
                self.script.announced.lock().insert(token, service.clone());
                reply.registered(service.clone());
            }
            ReplyMode::Fail(code) => reply.failed(code),
            ReplyMode::Defer => {
                self.script.announced.lock().insert(token, service.clone());
                self.script
                    .deferred_registers
                    .lock()
                    .push((service.clone(), reply));
            }
            ReplyMode::Reject => return Err(BeaconError::backend("publisher rejected the service")),
        }
        Ok(token)
    }

    fn unregister(&self, registration: &u64, reply: UnregisterReply) {
        let mode = self.script.unregister_mode.lock().unwrap_or(ReplyMode::Immediate);
        match mode {
            ReplyMode::Fail(code) => reply.failed(code),
            _ => match self.script.announced.lock().remove(registration) {
                Some(service) => reply.unregistered(service),
                None => reply.failed(404),
            },
        }
    }

    fn close(&self) -> Result<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn descriptor(name: &str, service_type: &str, port: u16) -> ServiceDescriptor {
    ServiceDescriptor::builder(name, service_type)
        .port(port)
        .build()
        .expect("valid test descriptor")
}

pub fn printer() -> ServiceDescriptor {
    descriptor("printer", "_http._tcp", 8080)
}

/// Next stream item, failing the test instead of hanging.
pub async fn next_item(stream: &mut EventStream) -> Option<Result<Event>> {
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("timed out waiting for a stream item")
}

pub async fn next_event(stream: &mut EventStream) -> Event {
    next_item(stream)
        .await
        .expect("stream ended")
        .expect("stream failed")
}

/// Asserts nothing arrives on `stream` for a short while.
pub async fn assert_quiet(stream: &mut EventStream) {
    let result = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(result.is_err(), "unexpected stream item: {:?}", result);
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("beacon_discovery=debug")
        .with_test_writer()
        .try_init();
}
