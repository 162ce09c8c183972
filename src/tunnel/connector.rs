use super::codec::{encode_request, read_response_body, read_response_head, DEFAULT_MAX_HEADER_SIZE};
use super::handler::{ProxyResponsePart, ProxyTunnelHandler};
use crate::auth::{AuthScheme, AuthorizationChallengeHandler, ChallengeHolder, CredentialHandler, SharedChallengeHolder};
use crate::config::{ProxyConfig, TimeoutConfig};
use crate::error::TransportError;
use crate::timeout::{ExceptionSink, TimeoutHandler};
use http::{Request, StatusCode};
use log::{debug, info};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use url::Url;

pub const DEFAULT_PROXY_PORT: u16 = 8080;

// none, basic, digest
const MAX_ATTEMPTS: usize = 3;

/// Opens tunnels through one HTTP proxy.
///
/// Connectors built from the same proxy should share a challenge holder so a
/// challenge learned on one connection is answered up front on the next.
#[derive(Clone)]
pub struct ProxyTunnelConnector {
    proxy_address: String,
    credentials: Option<Arc<dyn CredentialHandler>>,
    challenge_holder: SharedChallengeHolder,
    timeouts: TimeoutConfig,
    max_header_size: usize,
}

impl ProxyTunnelConnector {
    pub fn new(proxy_address: impl Into<String>) -> Self {
        Self {
            proxy_address: proxy_address.into(),
            credentials: None,
            challenge_holder: ChallengeHolder::new_shared(),
            timeouts: TimeoutConfig::default(),
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }

    pub fn from_config(proxy: &ProxyConfig, timeouts: &TimeoutConfig) -> Result<Self, TransportError> {
        let mut connector = Self::new(proxy_authority(&proxy.proxy_url)?).with_timeouts(timeouts.clone());
        if let Some(max) = proxy.max_header_size {
            connector = connector.with_max_header_size(max);
        }
        if let Some(username) = &proxy.username {
            let password = proxy.password.as_deref().unwrap_or_default();
            connector = connector.with_credentials(Arc::new(AuthorizationChallengeHandler::new(
                username.as_str(),
                password,
            )));
        }
        Ok(connector)
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialHandler>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    pub fn with_challenge_holder(mut self, holder: SharedChallengeHolder) -> Self {
        self.challenge_holder = holder;
        self
    }

    pub fn proxy_address(&self) -> &str {
        &self.proxy_address
    }

    pub fn challenge_holder(&self) -> SharedChallengeHolder {
        self.challenge_holder.clone()
    }

    /// Connects to the proxy and asks it for a tunnel to `target`.
    ///
    /// A 407 is retried on a fresh connection as long as the challenges it
    /// published select a scheme that has not been answered yet.
    pub async fn connect(&self, target: &str) -> Result<EstablishedTunnel<TcpStream>, TransportError> {
        let mut tried = Vec::with_capacity(MAX_ATTEMPTS);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let challenged = self.challenge_holder.load().is_some();
            let stream = TcpStream::connect(&self.proxy_address).await?;
            stream.set_nodelay(true)?;

            let err = match self.establish(stream, target).await {
                Ok(tunnel) => {
                    info!(
                        "Tunnel to {} through {} established (auth: {})",
                        target,
                        self.proxy_address,
                        tunnel.auth_scheme()
                    );
                    return Ok(tunnel);
                }
                Err(TransportError::ProxyConnect(err))
                    if err.status() == Some(StatusCode::PROXY_AUTHENTICATION_REQUIRED) =>
                {
                    err
                }
                Err(e) => return Err(e),
            };

            // Unchallenged attempts only discover what the proxy wants.
            if challenged {
                tried.push(err.auth_scheme());
            }
            let holder = self.challenge_holder.load_full();
            let next = ProxyTunnelHandler::preferred_scheme(holder.as_deref());

            if self.credentials.is_none()
                || next == AuthScheme::None
                || tried.contains(&next)
                || attempts >= MAX_ATTEMPTS
            {
                return Err(err.into());
            }
            debug!("Proxy {} asked for {} authentication, retrying", self.proxy_address, next);
        }
    }

    /// Runs one CONNECT exchange over `stream`.
    pub async fn establish<S>(&self, stream: S, target: &str) -> Result<EstablishedTunnel<S>, TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handler = ProxyTunnelHandler::new(
            self.proxy_address.clone(),
            self.credentials.clone(),
            self.challenge_holder.clone(),
        );
        let request = handler.new_initial_message(target)?;

        let timeouts = TimeoutHandler::from_config(&self.timeouts);
        let (sink, mut exceptions) = ExceptionSink::channel();
        timeouts.handler_added(sink);

        let mut stream = BufReader::new(stream);
        let result = tokio::select! {
            result = exchange(&mut handler, &mut stream, &request, &timeouts, self.max_header_size) => result,
            Some(err) = exceptions.recv() => Err(err),
        };
        timeouts.handler_removed();
        result?;

        Ok(EstablishedTunnel {
            stream,
            auth_scheme: handler.auth_scheme(),
        })
    }

    /// Establishes a tunnel and runs a TLS handshake with the target over it.
    pub async fn connect_tls(
        &self,
        target: &str,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<TlsStream<EstablishedTunnel<TcpStream>>, TransportError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::Config(format!("Invalid TLS server name '{}': {}", server_name, e)))?;

        let tunnel = self.connect(target).await?;
        TlsConnector::from(config)
            .connect(name, tunnel)
            .await
            .map_err(|e| TransportError::Tls(e).unwrap_proxy_connect())
    }
}

async fn exchange<S>(
    handler: &mut ProxyTunnelHandler,
    stream: &mut BufReader<S>,
    request: &Request<()>,
    timeouts: &TimeoutHandler,
    max_header_size: usize,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let encoded = encode_request(request);
    timeouts
        .write()
        .track(async {
            stream.write_all(&encoded).await?;
            stream.flush().await
        })
        .await?;
    timeouts.request_sent();

    let head = read_response_head(stream, max_header_size).await?;
    timeouts.response_received();
    timeouts.channel_read_complete();

    let Some(head) = head else {
        // Closed before any response: always an error.
        return handler.handle_response(ProxyResponsePart::LastContent).map(drop);
    };

    let body = read_response_body(stream, &head).await?;
    timeouts.channel_read_complete();
    handler.handle_response(ProxyResponsePart::Head(head))?;

    if !body.is_empty() {
        handler.handle_response(ProxyResponsePart::Content(body))?;
    }
    handler.handle_response(ProxyResponsePart::LastContent).map(drop)
}

/// An open tunnel. Bytes the proxy sent after its response head are still
/// buffered and are read first.
pub struct EstablishedTunnel<S> {
    stream: BufReader<S>,
    auth_scheme: AuthScheme,
}

impl<S> EstablishedTunnel<S> {
    /// The scheme the successful CONNECT authenticated with.
    pub fn auth_scheme(&self) -> AuthScheme {
        self.auth_scheme
    }
}

impl<S: AsyncRead> EstablishedTunnel<S> {
    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn into_inner(self) -> BufReader<S> {
        self.stream
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for EstablishedTunnel<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for EstablishedTunnel<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// `host:port` of a proxy given as a URL or a bare authority.
pub fn proxy_authority(proxy_url: &str) -> Result<String, TransportError> {
    let with_scheme = if proxy_url.contains("://") {
        proxy_url.to_string()
    } else {
        format!("http://{}", proxy_url)
    };
    let parsed = Url::parse(&with_scheme)?;

    if parsed.scheme() != "http" {
        return Err(TransportError::Config(format!(
            "Unsupported proxy scheme '{}', only http is supported",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::Config(format!("Invalid proxy host in '{}'", proxy_url)))?;
    let port = parsed.port().unwrap_or(DEFAULT_PROXY_PORT);
    Ok(format!("{}:{}", host, port))
}

/// Client TLS configuration trusting the certificates in a PEM file.
pub fn tls_client_config(ca_file: &Path) -> Result<Arc<ClientConfig>, TransportError> {
    let mut reader = StdBufReader::new(
        File::open(ca_file)
            .map_err(|e| TransportError::Config(format!("Failed to open CA file {}: {}", ca_file.display(), e)))?,
    );

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Config(format!("Failed to read CA certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Config("No valid CA certificate found".to_string()));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!("Loaded {} CA certificates ({} ignored)", added, ignored);

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
