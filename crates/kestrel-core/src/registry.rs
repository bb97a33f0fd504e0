//! Registry and registration interfaces.
//!
//! Discovery and registration live outside the transport core. The core
//! consumes snapshots of the registry's endpoint table and announces its own
//! clients through a registration provider. Both are passed in explicitly;
//! there is no ambient singleton.

use crate::EndpointDescriptor;

/// Source of endpoint snapshots.
///
/// The returned sequence reflects the registry at call time; it is never
/// kept live by the caller.
pub trait ServiceRegistry: Send + Sync {
    fn get_service_endpoints(&self, service_name: &str) -> Vec<EndpointDescriptor>;
}

/// Identity of the calling process, supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub host_name: String,
    pub process_name: String,
    pub unit_name: String,
    pub process_id: u32,
}

/// Advertisement record a client publishes about itself.
#[derive(Debug, Clone)]
pub struct ClientAdvertisement {
    pub host_name: String,
    pub process_name: String,
    pub unit_name: String,
    pub process_id: u32,
    pub service_name: String,
    pub service_id: String,
    pub protocol_version: u8,
}

impl ClientAdvertisement {
    pub fn new(
        process: &ProcessInfo,
        service_name: impl Into<String>,
        service_id: impl Into<String>,
        protocol_version: u8,
    ) -> Self {
        Self {
            host_name: process.host_name.clone(),
            process_name: process.process_name.clone(),
            unit_name: process.unit_name.clone(),
            process_id: process.process_id,
            service_name: service_name.into(),
            service_id: service_id.into(),
            protocol_version,
        }
    }
}

/// Sink for client advertisements.
pub trait RegistrationProvider: Send + Sync {
    fn register_client(
        &self,
        service_name: &str,
        service_id: &str,
        sample: &ClientAdvertisement,
        force: bool,
    );

    fn unregister_client(&self, service_name: &str, service_id: &str, sample: &ClientAdvertisement);
}
