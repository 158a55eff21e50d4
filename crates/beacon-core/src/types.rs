//! Service and event types shared by discovery and registration.
//!
//! A [`ServiceDescriptor`] is immutable once built. Subscribers receive them
//! wrapped in an [`Event`], and registrations are keyed by the descriptor's
//! [`ServiceIdentity`] (name plus service type).

use crate::error::DescriptorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Longest DNS label, which bounds the instance name.
const MAX_INSTANCE_NAME_LEN: usize = 63;

/// Identity of a service: the pair that stays stable across re-announcements.
///
/// Two descriptors with the same identity describe the same service even if
/// their addresses, port, or TXT records differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Instance name (e.g. "printer")
    pub name: String,

    /// Normalized service type (e.g. "_http._tcp")
    pub service_type: String,
}

impl ServiceIdentity {
    /// Creates an identity, normalizing the service type.
    pub fn new(name: impl Into<String>, service_type: &str) -> Self {
        Self {
            name: name.into(),
            service_type: normalize_service_type(service_type),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.service_type)
    }
}

/// A single TXT record entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxtEntry {
    pub key: String,
    pub value: String,
}

/// A discovered or registered service.
///
/// # Examples
///
/// ```
/// use beacon_core::types::ServiceDescriptor;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let service = ServiceDescriptor::builder("printer", "_ipp._tcp")
///     .address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)))
///     .port(631)
///     .txt("rp", "printers/office")
///     .build()
///     .unwrap();
///
/// assert_eq!(service.txt("rp"), Some("printers/office"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    name: String,
    service_type: String,
    addresses: Vec<IpAddr>,
    port: u16,
    txt: Vec<TxtEntry>,
}

impl ServiceDescriptor {
    /// Creates a new builder for a service with the given name and type.
    pub fn builder(name: impl Into<String>, service_type: impl Into<String>) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder::new(name, service_type)
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized service type, without the domain (e.g. "_http._tcp").
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Host addresses, in the order they were added.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Service port. Zero for services that were reported lost before being resolved.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// TXT records in insertion order.
    pub fn txt_records(&self) -> impl Iterator<Item = (&str, &str)> {
        self.txt.iter().map(|e| (e.key.as_str(), e.value.as_str()))
    }

    /// Looks up a single TXT record value.
    pub fn txt(&self, key: &str) -> Option<&str> {
        self.txt
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Returns the identity used to key registrations.
    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            name: self.name.clone(),
            service_type: self.service_type.clone(),
        }
    }

    /// Returns the primary address (prefer IPv4)
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| self.addresses.first())
            .copied()
    }

    /// Returns the fully qualified DNS-SD name under `domain` (e.g. "local.").
    pub fn fullname(&self, domain: &str) -> String {
        format!("{}.{}.{}", self.name, self.service_type, domain.trim_start_matches('.'))
    }

    /// Returns the service type qualified with `domain`, as mDNS browsers expect it.
    pub fn qualified_type(&self, domain: &str) -> String {
        qualify_service_type(&self.service_type, domain)
    }

    /// Checks the extra constraints a service must satisfy to be announced.
    pub fn validate_for_registration(&self) -> Result<(), DescriptorError> {
        if self.port == 0 {
            return Err(DescriptorError::invalid_value(
                "port",
                "a registered service needs a non-zero port",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary_address() {
            Some(addr) => write!(f, "{}.{} @ {}:{}", self.name, self.service_type, addr, self.port),
            None => write!(f, "{}.{}", self.name, self.service_type),
        }
    }
}

/// Incremental builder for [`ServiceDescriptor`].
#[derive(Debug, Clone, Default)]
pub struct ServiceDescriptorBuilder {
    name: String,
    service_type: String,
    addresses: Vec<IpAddr>,
    port: u16,
    txt: Vec<TxtEntry>,
}

impl ServiceDescriptorBuilder {
    /// Starts a builder for the given name and type.
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            ..Default::default()
        }
    }

    /// Adds a host address. Duplicates are ignored.
    pub fn address(mut self, addr: IpAddr) -> Self {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
        self
    }

    /// Adds several host addresses.
    pub fn addresses(self, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        addrs.into_iter().fold(self, |b, addr| b.address(addr))
    }

    /// Sets the service port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Adds a TXT record. Setting an existing key replaces its value in place.
    pub fn txt(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.txt.iter_mut().find(|e| e.key == key) {
            Some(entry) => entry.value = value,
            None => self.txt.push(TxtEntry { key, value }),
        }
        self
    }

    /// Validates and builds the descriptor.
    pub fn build(self) -> Result<ServiceDescriptor, DescriptorError> {
        if self.name.is_empty() {
            return Err(DescriptorError::missing_field("name"));
        }
        if self.name.len() > MAX_INSTANCE_NAME_LEN {
            return Err(DescriptorError::invalid_value(
                "name",
                format!("longer than {} bytes", MAX_INSTANCE_NAME_LEN),
            ));
        }

        let service_type = parse_service_type(&self.service_type)?;

        for entry in &self.txt {
            validate_txt_key(&entry.key)?;
        }

        Ok(ServiceDescriptor {
            name: self.name,
            service_type,
            addresses: self.addresses,
            port: self.port,
            txt: self.txt,
        })
    }
}

/// Strips a trailing dot and the `.local` domain from a service type.
pub fn normalize_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim().trim_end_matches('.');
    trimmed
        .strip_suffix(".local")
        .unwrap_or(trimmed)
        .to_string()
}

/// Appends `domain` to a normalized service type ("_http._tcp" → "_http._tcp.local.").
pub fn qualify_service_type(service_type: &str, domain: &str) -> String {
    let domain = domain.trim_start_matches('.');
    let domain = if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{}.", domain)
    };
    format!("{}.{}", normalize_service_type(service_type), domain)
}

/// Normalizes and validates a service type in one step.
///
/// ```
/// use beacon_core::types::parse_service_type;
///
/// assert_eq!(parse_service_type("_ipp._tcp.local.").unwrap(), "_ipp._tcp");
/// assert!(parse_service_type("ipp").is_err());
/// ```
pub fn parse_service_type(service_type: &str) -> Result<String, DescriptorError> {
    let normalized = normalize_service_type(service_type);
    validate_service_type(&normalized)?;
    Ok(normalized)
}

fn validate_service_type(service_type: &str) -> Result<(), DescriptorError> {
    let invalid = || DescriptorError::InvalidServiceType {
        value: service_type.to_string(),
    };

    let mut labels = service_type.split('.');
    let (Some(service), Some(proto), None) = (labels.next(), labels.next(), labels.next()) else {
        return Err(invalid());
    };

    if service.len() < 2 || !service.starts_with('_') {
        return Err(invalid());
    }
    if proto != "_tcp" && proto != "_udp" {
        return Err(invalid());
    }
    Ok(())
}

fn validate_txt_key(key: &str) -> Result<(), DescriptorError> {
    if key.is_empty() {
        return Err(DescriptorError::InvalidTxtKey {
            key: key.to_string(),
            reason: "key cannot be empty".to_string(),
        });
    }
    if key.contains('=') {
        return Err(DescriptorError::InvalidTxtKey {
            key: key.to_string(),
            reason: "key cannot contain '='".to_string(),
        });
    }
    if !key.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(DescriptorError::InvalidTxtKey {
            key: key.to_string(),
            reason: "key must be printable ASCII".to_string(),
        });
    }
    Ok(())
}

/// A state transition observed for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "service", rename_all = "snake_case")]
pub enum Event {
    /// A service was discovered and resolved
    Added(ServiceDescriptor),

    /// A previously announced service went away
    Removed(ServiceDescriptor),

    /// A local service was announced
    Registered(ServiceDescriptor),

    /// A local service announcement was withdrawn
    Unregistered(ServiceDescriptor),
}

impl Event {
    /// Returns the kind of transition.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Added(_) => EventKind::Added,
            Event::Removed(_) => EventKind::Removed,
            Event::Registered(_) => EventKind::Registered,
            Event::Unregistered(_) => EventKind::Unregistered,
        }
    }

    /// Returns the service carried by this event.
    pub fn service(&self) -> &ServiceDescriptor {
        match self {
            Event::Added(s) | Event::Removed(s) | Event::Registered(s) | Event::Unregistered(s) => s,
        }
    }

    /// Consumes the event and returns its service.
    pub fn into_service(self) -> ServiceDescriptor {
        match self {
            Event::Added(s) | Event::Removed(s) | Event::Registered(s) | Event::Unregistered(s) => s,
        }
    }
}

/// Kinds of service events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Removed,
    Registered,
    Unregistered,
}

impl EventKind {
    pub fn description(&self) -> &str {
        match self {
            EventKind::Added => "Service discovered on network",
            EventKind::Removed => "Service lost or removed",
            EventKind::Registered => "Service announced",
            EventKind::Unregistered => "Service announcement withdrawn",
        }
    }
}
