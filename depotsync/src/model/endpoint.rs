//! Download endpoints.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::AppId;

/// Transport used to reach an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Http,
    #[default]
    Https,
}

impl TransportKind {
    /// URL scheme for this transport.
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// One interchangeable download server.
///
/// Endpoints are created by a pool refill and never mutated afterwards; they
/// only circulate between the pool and in-flight fetches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name used for connecting and for deduplication.
    pub host: String,
    /// Virtual host sent with requests.
    pub vhost: String,
    /// TCP port.
    pub port: u16,
    /// Transport kind.
    #[serde(default)]
    pub transport: TransportKind,
    /// Apps this endpoint serves. `None` means no filtering metadata.
    #[serde(default)]
    pub allowed_apps: Option<Vec<AppId>>,
}

impl Endpoint {
    /// Create an endpoint without app filtering metadata.
    pub fn new(host: impl Into<String>, port: u16, transport: TransportKind) -> Self {
        let host = host.into();
        Self {
            vhost: host.clone(),
            host,
            port,
            transport,
            allowed_apps: None,
        }
    }

    /// Restrict the endpoint to the given apps.
    pub fn with_allowed_apps(mut self, apps: Vec<AppId>) -> Self {
        self.allowed_apps = Some(apps);
        self
    }

    /// Whether this endpoint may serve content for `app`.
    ///
    /// Endpoints without filtering metadata serve every app.
    pub fn serves(&self, app: AppId) -> bool {
        match &self.allowed_apps {
            Some(apps) => apps.contains(&app),
            None => true,
        }
    }

    /// Base URL of the endpoint.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.transport.scheme(), self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.vhost, self.host, self.port)
    }
}
