//! Browsing over `mdns-sd`.
//!
//! Every browse session owns its own [`ServiceDaemon`]. A pump thread reads
//! the daemon's event channel and translates it:
//!
//! - `ServiceFound` → `service_found(fullname)`, queued for resolution
//! - `ServiceResolved` → cached, answers the waiting resolve if it matches
//! - `ServiceRemoved` → `service_lost(..)`, fails the waiting resolve if it matches
//!
//! The daemon resolves on its own, so `resolve` only waits for (or reads)
//! the cached result.

use crate::error::{codes, daemon_error};
use beacon_core::types::normalize_service_type;
use beacon_core::{BeaconError, DescriptorError, Result, ServiceDescriptor};
use beacon_discovery::{DiscoverySink, ResolveReply, ServiceBrowser};
use flume::RecvTimeoutError;
use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How long a resolve waits for the daemon before failing.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the pump wakes up to expire a stuck resolve.
const PUMP_TICK: Duration = Duration::from_millis(500);

/// A reply ready to be answered once the lock is released.
type Ready = (ResolveReply, std::result::Result<ServiceDescriptor, i32>);

struct Waiting {
    fullname: String,
    reply: ResolveReply,
    since: Instant,
}

/// Resolved services by fullname, plus the one resolve waiting on the daemon.
#[derive(Default)]
struct Resolutions {
    cache: HashMap<String, ServiceDescriptor>,
    waiting: Option<Waiting>,
}

impl Resolutions {
    fn request(&mut self, fullname: String, reply: ResolveReply) -> Option<Ready> {
        if let Some(service) = self.cache.get(&fullname) {
            return Some((reply, Ok(service.clone())));
        }

        let previous = self.waiting.replace(Waiting {
            fullname,
            reply,
            since: Instant::now(),
        });
        previous.map(|w| (w.reply, Err(codes::SUPERSEDED)))
    }

    fn resolved(&mut self, fullname: &str, service: ServiceDescriptor) -> Option<Ready> {
        self.cache.insert(fullname.to_string(), service.clone());
        self.take_waiting(fullname).map(|reply| (reply, Ok(service)))
    }

    fn invalid(&mut self, fullname: &str) -> Option<Ready> {
        self.take_waiting(fullname)
            .map(|reply| (reply, Err(codes::INVALID_RECORD)))
    }

    fn removed(&mut self, fullname: &str) -> (Option<ServiceDescriptor>, Option<Ready>) {
        let cached = self.cache.remove(fullname);
        let ready = self
            .take_waiting(fullname)
            .map(|reply| (reply, Err(codes::SERVICE_VANISHED)));
        (cached, ready)
    }

    fn expire(&mut self, timeout: Duration) -> Option<Ready> {
        if self.waiting.as_ref()?.since.elapsed() < timeout {
            return None;
        }
        self.waiting
            .take()
            .map(|w| (w.reply, Err(codes::RESOLVE_TIMEOUT)))
    }

    fn take_waiting(&mut self, fullname: &str) -> Option<ResolveReply> {
        match &self.waiting {
            Some(w) if w.fullname == fullname => self.waiting.take().map(|w| w.reply),
            _ => None,
        }
    }
}

fn answer(ready: Option<Ready>) {
    match ready {
        Some((reply, Ok(service))) => reply.resolved(service),
        Some((reply, Err(code))) => reply.failed(code),
        None => {}
    }
}

/// Browse handle for one service type.
pub struct MdnsBrowser {
    service_type: String,
    qualified: String,
    daemon: ServiceDaemon,
    resolutions: Arc<Mutex<Resolutions>>,
    stopped: AtomicBool,
}

impl MdnsBrowser {
    pub(crate) fn open(service_type: &str, domain: &str) -> Result<Self> {
        let qualified = beacon_core::types::qualify_service_type(service_type, domain);
        let daemon = ServiceDaemon::new().map_err(|e| daemon_error("create mDNS daemon", e))?;

        debug!(service_type = %qualified, "Opened mDNS browser");
        Ok(Self {
            service_type: service_type.to_string(),
            qualified,
            daemon,
            resolutions: Arc::new(Mutex::new(Resolutions::default())),
            stopped: AtomicBool::new(false),
        })
    }

    /// Fully qualified type this browser queries (e.g. "_http._tcp.local.").
    pub fn qualified_type(&self) -> &str {
        &self.qualified
    }
}

impl ServiceBrowser for MdnsBrowser {
    type Entry = String;

    fn start_discovery(&self, sink: DiscoverySink<String>) -> Result<()> {
        let receiver = self
            .daemon
            .browse(&self.qualified)
            .map_err(|e| daemon_error(&format!("browse {}", self.qualified), e))?;

        let pump = Pump {
            service_type: self.service_type.clone(),
            qualified: self.qualified.clone(),
            sink,
            resolutions: self.resolutions.clone(),
        };
        std::thread::Builder::new()
            .name(format!("beacon-browse-{}", self.service_type))
            .spawn(move || pump.run(receiver))
            .map_err(|e| BeaconError::backend(format!("failed to spawn browse thread: {}", e)))?;

        info!(service_type = %self.qualified, "Browsing started");
        Ok(())
    }

    fn resolve(&self, entry: String, reply: ResolveReply) {
        trace!(service = %entry, "Resolve requested");
        let ready = self.resolutions.lock().request(entry, reply);
        answer(ready);
    }

    fn stop_discovery(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.daemon.stop_browse(&self.qualified) {
            debug!(service_type = %self.qualified, error = %e, "mDNS stop_browse failed");
        }
        let abandoned = self.resolutions.lock().waiting.take();
        drop(abandoned);

        self.daemon
            .shutdown()
            .map(|_| ())
            .map_err(|e| daemon_error("shut down mDNS daemon", e))?;

        info!(service_type = %self.qualified, "Browsing stopped");
        Ok(())
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            warn!(service_type = %self.qualified, "Browser dropped while still running");
            let _ = self.daemon.shutdown();
        }
    }
}

/// Moves daemon events into the sink until the daemon shuts down.
struct Pump {
    service_type: String,
    qualified: String,
    sink: DiscoverySink<String>,
    resolutions: Arc<Mutex<Resolutions>>,
}

impl Pump {
    fn run(self, receiver: Receiver<ServiceEvent>) {
        debug!(service_type = %self.qualified, "Browse pump started");

        loop {
            match receiver.recv_timeout(PUMP_TICK) {
                Ok(ServiceEvent::SearchStopped(_)) => break,
                Ok(event) => self.handle(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if self.sink.is_closed() {
                break;
            }
            let expired = self.resolutions.lock().expire(RESOLVE_TIMEOUT);
            if expired.is_some() {
                warn!(service_type = %self.qualified, "Resolve timed out");
            }
            answer(expired);
        }

        debug!(service_type = %self.qualified, "Browse pump stopped");
    }

    fn handle(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceFound(_, fullname) => {
                debug!(service = %fullname, "Service found");
                self.sink.service_found(fullname);
            }

            ServiceEvent::ServiceResolved(info) => {
                let fullname = info.get_fullname().to_string();
                let ready = match to_descriptor(&info) {
                    Ok(service) => {
                        debug!(service = %fullname, port = service.port(), "Service resolved");
                        self.resolutions.lock().resolved(&fullname, service)
                    }
                    Err(e) => {
                        warn!(service = %fullname, error = %e, "Ignoring malformed service record");
                        self.resolutions.lock().invalid(&fullname)
                    }
                };
                answer(ready);
            }

            ServiceEvent::ServiceRemoved(_, fullname) => {
                debug!(service = %fullname, "Service removed");
                let (cached, ready) = self.resolutions.lock().removed(&fullname);
                answer(ready);

                let lost = match cached {
                    Some(service) => Ok(service),
                    None => lost_descriptor(&fullname, &self.qualified, &self.service_type),
                };
                match lost {
                    Ok(service) => self.sink.service_lost(service),
                    Err(e) => warn!(service = %fullname, error = %e, "Cannot report removed service"),
                }
            }

            ServiceEvent::SearchStarted(ty) => trace!(service_type = %ty, "Search started"),

            other => trace!(?other, "Unhandled mDNS event"),
        }
    }
}

/// Converts a resolved record into a descriptor. Addresses are sorted so
/// equal records compare equal.
fn to_descriptor(info: &ServiceInfo) -> std::result::Result<ServiceDescriptor, DescriptorError> {
    let service_type = normalize_service_type(info.get_type());
    let name = instance_name(info.get_fullname(), info.get_type());

    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort();

    info.get_properties()
        .iter()
        .fold(
            ServiceDescriptor::builder(name, service_type)
                .addresses(addresses)
                .port(info.get_port()),
            |builder, property| builder.txt(property.key(), property.val_str()),
        )
        .build()
}

/// Descriptor for a service that went away before (or without) resolving.
fn lost_descriptor(
    fullname: &str,
    qualified: &str,
    service_type: &str,
) -> std::result::Result<ServiceDescriptor, DescriptorError> {
    ServiceDescriptor::builder(instance_name(fullname, qualified), service_type).build()
}

/// "My Printer._ipp._tcp.local." → "My Printer"
fn instance_name(fullname: &str, qualified: &str) -> String {
    fullname
        .strip_suffix(qualified)
        .and_then(|rest| rest.strip_suffix('.'))
        .or_else(|| fullname.find("._").map(|i| &fullname[..i]))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_discovery::ResolveOutcome;
    use std::net::Ipv4Addr;
    use std::sync::mpsc;

    fn reply() -> (ResolveReply, mpsc::Receiver<ResolveOutcome>) {
        let (tx, rx) = mpsc::channel();
        let reply = ResolveReply::from_fn("_http._tcp", move |outcome| {
            let _ = tx.send(outcome);
        });
        (reply, rx)
    }

    fn printer() -> ServiceDescriptor {
        ServiceDescriptor::builder("printer", "_http._tcp")
            .port(8080)
            .build()
            .unwrap()
    }

    const FULLNAME: &str = "printer._http._tcp.local.";

    #[test]
    fn test_instance_name() {
        assert_eq!(instance_name(FULLNAME, "_http._tcp.local."), "printer");
        assert_eq!(instance_name("My Printer._ipp._tcp.local.", "_ipp._tcp.local."), "My Printer");
        assert_eq!(instance_name("odd._x._tcp.local.", "_http._tcp.local."), "odd");
        assert_eq!(instance_name("plain", "_http._tcp.local."), "plain");
    }

    #[test]
    fn test_resolve_waits_for_daemon() {
        let mut resolutions = Resolutions::default();
        let (r, rx) = reply();

        answer(resolutions.request(FULLNAME.to_string(), r));
        assert!(rx.try_recv().is_err());

        answer(resolutions.resolved(FULLNAME, printer()));
        assert_eq!(rx.try_recv().unwrap(), ResolveOutcome::Resolved(printer()));
    }

    #[test]
    fn test_cached_resolution_answers_immediately() {
        let mut resolutions = Resolutions::default();
        assert!(resolutions.resolved(FULLNAME, printer()).is_none());

        let (r, rx) = reply();
        answer(resolutions.request(FULLNAME.to_string(), r));
        assert_eq!(rx.try_recv().unwrap(), ResolveOutcome::Resolved(printer()));
    }

    #[test]
    fn test_removal_fails_waiting_resolve() {
        let mut resolutions = Resolutions::default();
        let (r, rx) = reply();
        answer(resolutions.request(FULLNAME.to_string(), r));

        let (cached, ready) = resolutions.removed(FULLNAME);
        assert!(cached.is_none());
        answer(ready);
        assert_eq!(rx.try_recv().unwrap(), ResolveOutcome::Failed(codes::SERVICE_VANISHED));
    }

    #[test]
    fn test_unrelated_resolution_does_not_answer() {
        let mut resolutions = Resolutions::default();
        let (r, rx) = reply();
        answer(resolutions.request(FULLNAME.to_string(), r));

        answer(resolutions.resolved("scanner._http._tcp.local.", printer()));
        assert!(rx.try_recv().is_err());
        assert!(resolutions.waiting.is_some());
    }

    #[test]
    fn test_expire_times_out_waiting_resolve() {
        let mut resolutions = Resolutions::default();
        let (r, rx) = reply();
        answer(resolutions.request(FULLNAME.to_string(), r));

        assert!(resolutions.expire(Duration::from_secs(60)).is_none());
        answer(resolutions.expire(Duration::ZERO));
        assert_eq!(rx.try_recv().unwrap(), ResolveOutcome::Failed(codes::RESOLVE_TIMEOUT));
    }

    #[test]
    fn test_to_descriptor() {
        let info = ServiceInfo::new(
            "_http._tcp.local.",
            "printer",
            "host.local.",
            "192.168.1.20",
            8080,
            &[("path", "/queue")][..],
        )
        .unwrap();

        let service = to_descriptor(&info).unwrap();
        assert_eq!(service.name(), "printer");
        assert_eq!(service.service_type(), "_http._tcp");
        assert_eq!(service.port(), 8080);
        assert_eq!(service.txt("path"), Some("/queue"));
        assert_eq!(
            service.addresses(),
            &[IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))]
        );
    }

    #[test]
    fn test_lost_descriptor_from_fullname() {
        let service = lost_descriptor(FULLNAME, "_http._tcp.local.", "_http._tcp").unwrap();
        assert_eq!(service.name(), "printer");
        assert_eq!(service.port(), 0);
    }
}
