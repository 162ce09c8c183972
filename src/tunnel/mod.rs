//! HTTP/1.1 CONNECT tunneling through an authenticating proxy.

pub mod codec;
pub mod connector;
pub mod handler;

pub use connector::{EstablishedTunnel, ProxyTunnelConnector};
pub use handler::{ProxyResponsePart, ProxyTunnelHandler};
