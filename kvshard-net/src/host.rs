//! Per-server service registry and `Service.Method` dispatch.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use crate::service::{MethodOutcome, Service};

/// Holds the services registered on one simulated server process.
///
/// One mutex guards the registry and call counter; method dispatch itself
/// runs outside the mutex, so a slow handler never blocks registration of
/// a different service or a concurrent call count read.
pub struct ServerHost {
    services: Mutex<HashMap<String, Box<dyn Service>>>,
    count: Mutex<u64>,
}

impl Default for ServerHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHost {
    pub fn new() -> Self {
        ServerHost {
            services: Mutex::new(HashMap::new()),
            count: Mutex::new(0),
        }
    }

    pub fn add_service(&self, svc: Box<dyn Service>) {
        let mut services = self.services.lock().unwrap();
        services.insert(svc.name().to_string(), svc);
    }

    pub fn call_count(&self) -> u64 {
        *self.count.lock().unwrap()
    }

    /// Splits `"Service.Method"` on the last `.` and dispatches.
    ///
    /// An unknown service name is a fatal configuration error: it means
    /// the cluster was wired up wrong, not that a message was lost.
    pub fn dispatch(&self, svc_method: &str, args: &[u8]) -> MethodOutcome {
        let dot = svc_method
            .rfind('.')
            .unwrap_or_else(|| panic!("ServerHost::dispatch: malformed method {svc_method:?}, expected Service.Method"));
        let (service_name, rest) = svc_method.split_at(dot);
        let method_name = &rest[1..];

        *self.count.lock().unwrap() += 1;

        let services = self.services.lock().unwrap();
        let Some(service) = services.get(service_name) else {
            let known: Vec<&str> = services.keys().map(String::as_str).collect();
            panic!(
                "ServerHost::dispatch: unknown service {service_name:?} in {svc_method:?}; expecting one of {known:?}"
            );
        };
        trace!(service = service_name, method = method_name, "dispatching");
        service.call(method_name, args)
    }
}
