//! Announcing services over `mdns-sd`.

use crate::error::{codes, daemon_error};
use beacon_core::{Result, ServiceDescriptor};
use beacon_discovery::{RegisterReply, ServicePublisher, UnregisterReply};
use mdns_sd::{ServiceDaemon, ServiceInfo, UnregisterStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Control handle for one announcement.
#[derive(Debug, Clone)]
pub struct MdnsRegistration {
    fullname: String,
    service: ServiceDescriptor,
}

impl MdnsRegistration {
    /// DNS-SD fullname the daemon announces (e.g. "printer._http._tcp.local.").
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }
}

/// One daemon shared by every live registration.
pub struct MdnsPublisher {
    daemon: ServiceDaemon,
    host_name: String,
    domain: String,
    closed: AtomicBool,
}

impl MdnsPublisher {
    pub(crate) fn open(host_name: &str, domain: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| daemon_error("create mDNS daemon", e))?;
        info!(host = host_name, "mDNS publisher opened");
        Ok(Self {
            daemon,
            host_name: host_name.to_string(),
            domain: domain.to_string(),
            closed: AtomicBool::new(false),
        })
    }

    fn service_info(&self, service: &ServiceDescriptor) -> Result<ServiceInfo> {
        let properties: Vec<(&str, &str)> = service.txt_records().collect();
        let addresses = service
            .addresses()
            .iter()
            .map(|addr| addr.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let info = ServiceInfo::new(
            &service.qualified_type(&self.domain),
            service.name(),
            &self.host_name,
            addresses.as_str(),
            service.port(),
            &properties[..],
        )
        .map_err(|e| daemon_error(&format!("build record for {}", service.identity()), e))?;

        // Only auto-detect addresses when none were given
        Ok(if service.addresses().is_empty() {
            info.enable_addr_auto()
        } else {
            info
        })
    }
}

impl ServicePublisher for MdnsPublisher {
    type Registration = MdnsRegistration;

    fn register(&self, service: &ServiceDescriptor, reply: RegisterReply) -> Result<MdnsRegistration> {
        let info = self.service_info(service)?;
        let fullname = info.get_fullname().to_string();

        self.daemon
            .register(info)
            .map_err(|e| daemon_error(&format!("register {}", fullname), e))?;

        info!(service = %fullname, port = service.port(), "Service announced");
        reply.registered(service.clone());

        Ok(MdnsRegistration {
            fullname,
            service: service.clone(),
        })
    }

    fn unregister(&self, registration: &MdnsRegistration, reply: UnregisterReply) {
        let status = match self.daemon.unregister(&registration.fullname) {
            Ok(status) => status,
            Err(e) => {
                warn!(service = %registration.fullname, error = %e, "mDNS unregister failed");
                reply.failed(codes::DAEMON_GONE);
                return;
            }
        };

        // Wait for the daemon's answer off the caller's thread
        let fullname = registration.fullname.clone();
        let service = registration.service.clone();
        let spawned = std::thread::Builder::new()
            .name("beacon-unregister".to_string())
            .spawn(move || match status.recv() {
                Ok(UnregisterStatus::OK) => {
                    info!(service = %fullname, "Service withdrawn");
                    reply.unregistered(service);
                }
                Ok(UnregisterStatus::NotFound) => {
                    warn!(service = %fullname, "Daemon did not know the service");
                    reply.failed(codes::NOT_FOUND);
                }
                Err(_) => {
                    debug!(service = %fullname, "Daemon stopped before answering");
                    reply.failed(codes::DAEMON_GONE);
                }
            });

        if let Err(e) = spawned {
            // The reply went down with the closure and reported the failure
            warn!(service = %registration.fullname, error = %e, "Failed to spawn unregister waiter");
        }
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.daemon
            .shutdown()
            .map(|_| ())
            .map_err(|e| daemon_error("shut down mDNS daemon", e))?;
        info!("mDNS publisher closed");
        Ok(())
    }
}

impl Drop for MdnsPublisher {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!("Publisher dropped while still open");
            let _ = self.daemon.shutdown();
        }
    }
}

/// Host name announced for registrations: the configured one, or the
/// system host name, qualified with `domain`.
pub(crate) fn announced_host_name(configured: Option<&str>, domain: &str) -> String {
    let host = match configured {
        Some(host) => host.to_string(),
        None => hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|e| {
                warn!(error = %e, "Cannot read system host name, using 'localhost'");
                "localhost".to_string()
            }),
    };

    let domain = domain.trim_start_matches('.');
    let suffix = domain.trim_end_matches('.');
    let host = host.trim_end_matches('.');
    if host.ends_with(&format!(".{}", suffix)) {
        format!("{}.", host)
    } else {
        format!("{}.{}.", host, suffix)
    }
}
