//! Free local port allocation
//!
//! Ports are found by binding port 0 on the loopback interface and releasing
//! the listener immediately. A released port can be handed out again by the
//! kernel, so every suggested port is reserved in-process for
//! [`RESERVATION_WINDOW`] to keep concurrent provider starts from colliding.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::{Error, Result};

/// How long a suggested port stays reserved for its caller
pub const RESERVATION_WINDOW: Duration = Duration::from_secs(60);

/// Attempts before giving up on finding an unreserved port
const MAX_ATTEMPTS: usize = 10;

static RESERVED: LazyLock<Mutex<HashMap<u16, Instant>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A local listen address handed to one supervised process
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceEndpoint {
    /// URL scheme (`http` or `https`)
    pub scheme: String,
    /// Host name or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServiceEndpoint {
    /// Create an endpoint from its parts
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `scheme://host:port`
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl std::fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url())
    }
}

/// Suggest a free endpoint on `host` for a process that will bind it later
pub fn suggest_endpoint(scheme: &str, host: &str) -> Result<ServiceEndpoint> {
    let port = suggest_port(host)?;
    Ok(ServiceEndpoint::new(scheme, host, port))
}

/// Suggest a free TCP port on `host`
pub fn suggest_port(host: &str) -> Result<u16> {
    for _ in 0..MAX_ATTEMPTS {
        let listener = TcpListener::bind((host, 0)).map_err(|e| {
            Error::resource_allocation(format!("unable to bind a free port on {}: {}", host, e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                Error::resource_allocation(format!("unable to read bound address: {}", e))
            })?
            .port();
        drop(listener);

        if reserve(port) {
            trace!(port, host, "reserved port");
            return Ok(port);
        }
    }

    Err(Error::resource_allocation(format!(
        "no unreserved port found on {} after {} attempts",
        host, MAX_ATTEMPTS
    )))
}

fn reserve(port: u16) -> bool {
    let now = Instant::now();
    let mut reserved = RESERVED.lock();
    reserved.retain(|_, at| now.duration_since(*at) < RESERVATION_WINDOW);
    if reserved.contains_key(&port) {
        return false;
    }
    reserved.insert(port, now);
    true
}
