pub mod auth;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod file_source;
pub mod logging;
pub mod reactive;
pub mod timeout;
pub mod tunnel;
pub mod write_subscriber;

pub use auth::{AuthScheme, AuthorizationChallengeHandler, ChallengeHolder, CredentialHandler};
pub use config::TransportConfig;
pub use error::{ProxyConnectError, TimeoutKind, TransportError};
pub use file_source::{ChunkedFileReadSource, FileRangeBody};
pub use timeout::{ExceptionSink, TimeoutHandler};
pub use tunnel::{EstablishedTunnel, ProxyTunnelConnector, ProxyTunnelHandler};
pub use write_subscriber::{ByteSink, ByteStreamWriteSubscriber, WriteSink};
