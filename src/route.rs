use std::{collections::HashMap, io, sync::Arc};

use n0_error::{e, stack_error};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::either::Either;
use tracing::warn;

use crate::parse::HttpMessage;

/// Hostname key that matches any virtual host without a specific route.
pub const WILDCARD_HOST: &str = "*";

/// One configured route: every listed hostname maps to the same endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub hostnames: Vec<String>,
    pub endpoint: EndpointConfig,
}

/// Endpoint description as it appears in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointConfig {
    /// A TCP backend.
    Tcp { host: String, port: u16 },
    /// A local IPC socket path.
    Ipc(String),
}

/// Configuration errors reported when building a route table.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    /// A route entry lists no hostnames at all.
    #[error("route entry {index} has no hostnames")]
    NoHostnames { index: usize },
    /// A route entry lists an empty hostname string.
    #[error("route entry {index} has an empty hostname")]
    EmptyHostname { index: usize },
}

/// A dialable backend address.
///
/// IPC paths are stored in their final, dialable form: on Windows the
/// named-pipe prefix is applied at config-build time so the connection path
/// stays OS-agnostic.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Endpoint {
    #[display("{host}:{port}")]
    Tcp { host: String, port: u16 },
    #[display("ipc:{path}")]
    Ipc { path: String },
}

/// The stream type produced by dialing an endpoint.
#[cfg(unix)]
pub type BackendStream = Either<TcpStream, tokio::net::UnixStream>;
/// The stream type produced by dialing an endpoint.
#[cfg(windows)]
pub type BackendStream = Either<TcpStream, tokio::net::windows::named_pipe::NamedPipeClient>;

impl Endpoint {
    fn from_config(config: &EndpointConfig) -> Self {
        match config {
            EndpointConfig::Tcp { host, port } => Self::Tcp {
                host: host.clone(),
                port: *port,
            },
            EndpointConfig::Ipc(path) => Self::Ipc {
                path: ipc_path(path),
            },
        }
    }

    /// Opens a connection to the backend this endpoint describes.
    pub async fn dial(&self) -> io::Result<BackendStream> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                Ok(Either::Left(stream))
            }
            #[cfg(unix)]
            Self::Ipc { path } => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Either::Right(stream))
            }
            #[cfg(windows)]
            Self::Ipc { path } => {
                let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(path)?;
                Ok(Either::Right(pipe))
            }
        }
    }
}

#[cfg(windows)]
fn ipc_path(path: &str) -> String {
    const PIPE_PREFIX: &str = r"\\.\pipe\";
    if path.starts_with(PIPE_PREFIX) {
        path.to_string()
    } else {
        format!("{PIPE_PREFIX}{path}")
    }
}

#[cfg(not(windows))]
fn ipc_path(path: &str) -> String {
    path.to_string()
}

/// Immutable snapshot of (virtual hostname -> endpoint) bindings.
///
/// Built once from configuration and replaced wholesale on reconfigure;
/// connection tasks hold an `Arc` to whichever snapshot was current when they
/// resolved.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Endpoint>,
}

impl RouteTable {
    /// Builds a table from config entries. A hostname that appears more than
    /// once keeps the later entry's endpoint and logs a warning.
    pub fn build(entries: &[RouteEntry]) -> Result<Self, ConfigError> {
        let mut routes = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            if entry.hostnames.is_empty() {
                return Err(e!(ConfigError::NoHostnames { index }));
            }
            let endpoint = Endpoint::from_config(&entry.endpoint);
            for hostname in &entry.hostnames {
                if hostname.is_empty() {
                    return Err(e!(ConfigError::EmptyHostname { index }));
                }
                let key = hostname.to_ascii_lowercase();
                if let Some(previous) = routes.insert(key, endpoint.clone()) {
                    warn!(%hostname, %previous, now=%endpoint, "duplicate route hostname, later entry wins");
                }
            }
        }
        Ok(Self { routes })
    }

    /// Looks up `host`, falling back to the wildcard entry.
    pub fn lookup(&self, host: &str) -> Option<&Endpoint> {
        let key = host.to_ascii_lowercase();
        self.routes.get(&key).or_else(|| self.routes.get(WILDCARD_HOST))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Endpoint)> {
        self.routes.iter().map(|(host, endpoint)| (host.as_str(), endpoint))
    }
}

/// Picks a backend endpoint for a parsed first request.
///
/// Resolvers run synchronously on the forwarding path and must not block;
/// they are pure functions of the in-memory message.
pub trait RouteResolver: Send + Sync {
    fn resolve(&self, request: &HttpMessage) -> Option<Endpoint>;
}

impl<F> RouteResolver for F
where
    F: Fn(&HttpMessage) -> Option<Endpoint> + Send + Sync,
{
    fn resolve(&self, request: &HttpMessage) -> Option<Endpoint> {
        self(request)
    }
}

/// How the proxy turns a first request into an endpoint.
#[derive(derive_more::Debug, Clone, Default)]
pub enum ResolveRoute {
    /// Look the `host` header up in the current route table, wildcard last.
    #[default]
    HostHeader,
    /// Delegate the decision entirely to a user resolver.
    #[debug("Custom(Arc<dyn RouteResolver>)")]
    Custom(Arc<dyn RouteResolver>),
}

impl<T: RouteResolver + 'static> From<T> for ResolveRoute {
    fn from(value: T) -> Self {
        Self::Custom(Arc::new(value))
    }
}

impl From<Arc<dyn RouteResolver>> for ResolveRoute {
    fn from(value: Arc<dyn RouteResolver>) -> Self {
        Self::Custom(value)
    }
}

impl ResolveRoute {
    /// Resolves `request` against `table` (ignored by custom resolvers).
    pub fn resolve(&self, request: &HttpMessage, table: &RouteTable) -> Option<Endpoint> {
        match self {
            Self::HostHeader => table.lookup(request.host()?).cloned(),
            Self::Custom(resolver) => resolver.resolve(request),
        }
    }
}
