//! Host-based TCP reverse proxy with inline HTTP interception.
//!
//! The proxy terminates client TCP connections, parses the first HTTP request
//! to pick a backend by virtual hostname, dials it (TCP or local IPC), and
//! relays bytes in both directions. Message heads traversing the proxy run
//! through user-registered interceptor pipelines; a `101 Switching Protocols`
//! response latches the connection into an opaque byte tunnel.

/// Interceptor pipelines applied to parsed message heads.
pub mod intercept;
/// Incremental HTTP/1.x parsing and head serialization.
pub mod parse;
/// Route configuration, endpoints, and resolvers.
pub mod route;
/// The proxy server and its control surface.
pub mod server;
/// The per-host registry of live client connections.
pub mod track;
/// The framed/opaque streaming transducers.
pub mod transduce;
mod util;

pub use intercept::{Interceptor, Interceptors};
pub use parse::{Headers, HttpMessage, MessageParser, ParseError, ParseEvent, Side, StartLine};
pub use route::{
    ConfigError, Endpoint, EndpointConfig, ResolveRoute, RouteEntry, RouteResolver, RouteTable,
    WILDCARD_HOST,
};
pub use server::{Callbacks, ConnectionError, ProxyServer, Status, StatusCallback};
pub use track::ConnectionTracker;
pub use transduce::{Protocol, SharedProtocol, Transducer};

/// How much of a message head to buffer before the stream is considered
/// invalid. 8KB should be plenty.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

#[cfg(test)]
mod tests;
