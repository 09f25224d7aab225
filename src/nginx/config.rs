//! Template input model for the generated nginx configuration.

use serde::{Deserialize, Serialize};

/// Protocol of an L4 upstream; HTTP and HTTPS have already been collapsed to
/// TCP by the time a value of this type exists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum L4Protocol {
    TCP,
    UDP,
}

/// One weighted upstream endpoint (a forked or canary service).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// DNS name of the endpoint service
    pub address: String,
    pub port: i32,
    /// Round-robin weight in percent
    pub weight: i32,
}

/// The Kubernetes service behind an L4 listen block.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct L4Backend {
    pub port: i32,
    pub name: String,
    pub namespace: String,
    pub protocol: L4Protocol,
}

/// One listen block: a local upstream port splitting traffic across two
/// weighted endpoints.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct L4Service {
    /// Upstream port the proxy listens on
    pub port: i32,
    pub backend: L4Backend,
    pub endpoints: Vec<Endpoint>,
}

impl L4Service {
    /// Equality that ignores endpoint ordering.
    pub fn same_as(&self, other: &L4Service) -> bool {
        if self.endpoints.len() != other.endpoints.len() {
            return false;
        }
        if !self
            .endpoints
            .iter()
            .all(|e| other.endpoints.contains(e))
        {
            return false;
        }
        self.port == other.port && self.backend == other.backend
    }
}

/// Knobs of the base nginx configuration that the template consumes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct NginxSettings {
    pub worker_processes: String,
    pub worker_connections: i32,
    pub keepalive_timeout: i32,
    pub enable_vts_status: bool,
    pub vts_status_port: i32,
}

impl Default for NginxSettings {
    fn default() -> Self {
        NginxSettings {
            worker_processes: "auto".to_string(),
            worker_connections: 16384,
            keepalive_timeout: 75,
            enable_vts_status: false,
            vts_status_port: 18080,
        }
    }
}

/// Everything the nginx template needs for one render.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct TemplateConfig {
    pub max_open_files: i64,
    pub backlog_size: i64,
    pub is_ipv6_enabled: bool,
    pub cfg: NginxSettings,
    pub tcp_backends: Vec<L4Service>,
    pub udp_backends: Vec<L4Service>,
}

impl TemplateConfig {
    /// Equality over the backend sets, ignoring ordering.
    ///
    /// Only the backends matter for reload decisions; the tunables are
    /// recomputed on every update.
    pub fn same_backends(&self, other: &TemplateConfig) -> bool {
        same_service_set(&self.tcp_backends, &other.tcp_backends)
            && same_service_set(&self.udp_backends, &other.udp_backends)
    }
}

fn same_service_set(a: &[L4Service], b: &[L4Service]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|s| b.iter().any(|o| s.same_as(o)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "config_test.rs"]
mod tests;
