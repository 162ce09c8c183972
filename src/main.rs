use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use proxy_transport::config::{ProxyConfig, StreamingConfig, TimeoutConfig, TransportConfig};
use proxy_transport::config_validation::TransportConfigValidator;
use proxy_transport::file_source::{BlockingFileChannel, ChunkedFileReadSource};
use proxy_transport::logging::{fallback_options, init_fallback, TransportLogger};
use proxy_transport::tunnel::connector::tls_client_config;
use proxy_transport::write_subscriber::{write_publisher, WriteSink};
use proxy_transport::{EstablishedTunnel, ProxyTunnelConnector};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;

#[derive(Parser)]
#[clap(
    version,
    about = "Opens a CONNECT tunnel through an HTTP proxy and reports how it authenticated"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, value_name = "URL", help = "Proxy URL (e.g., http://proxy.local:3128)")]
    proxy: Option<String>,

    #[clap(short, long, value_name = "HOST:PORT", help = "Tunnel target authority")]
    target: Option<String>,

    #[clap(long, value_name = "USERNAME", help = "Username for proxy authentication")]
    proxy_username: Option<String>,

    #[clap(long, value_name = "PASSWORD", help = "Password for proxy authentication")]
    proxy_password: Option<String>,

    #[clap(long, value_name = "MILLIS", help = "Read timeout in milliseconds (0 disables)")]
    read_timeout: Option<i64>,

    #[clap(long, value_name = "MILLIS", help = "Write timeout in milliseconds (0 disables)")]
    write_timeout: Option<i64>,

    #[clap(long, value_name = "MILLIS", help = "Response timeout in milliseconds (0 disables)")]
    response_timeout: Option<i64>,

    #[clap(long, value_name = "NAME", help = "Run a TLS handshake with this server name over the tunnel")]
    tls_server_name: Option<String>,

    #[clap(long, value_name = "FILE", help = "PEM file with trust anchors for the TLS handshake")]
    ca_file: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "Stream this file through the tunnel")]
    send_file: Option<PathBuf>,

    #[clap(long, value_name = "BYTES", default_value_t = 0, help = "Offset into the file to send")]
    offset: u64,

    #[clap(long, value_name = "BYTES", help = "Number of bytes to send (default: to end of file)")]
    length: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Chunk size for file reads")]
    chunk_size: Option<usize>,

    #[clap(long, value_name = "BYTES", help = "Maximum bytes per socket write")]
    max_bytes_per_write: Option<usize>,

    #[clap(long, value_name = "LEVEL", help = "Log level when no logging section is configured")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format (text or json) when no logging section is configured")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        sample_config().to_file(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            bail!("Configuration file not found: {}", config_file);
        }
        let mut config = TransportConfig::from_file(config_file)?;
        apply_overrides(&mut config, &args);
        config
    } else {
        let mut config = TransportConfig::default();
        apply_overrides(&mut config, &args);
        config
    };

    match config.logging.clone() {
        Some(logging) => TransportLogger::init(logging)?,
        None => {
            let (level, format) = fallback_options(args.log_level.as_deref(), args.log_format.as_deref())?;
            init_fallback(&level, &format)?
        }
    }

    let validation = TransportConfigValidator::new(&config).validate();
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("Suggestion: {}", suggestion);
    }
    if !validation.is_valid {
        bail!("Invalid configuration: {}", validation.errors.join("; "));
    }

    let proxy = config.proxy.as_ref().context("A proxy URL is required (--proxy or config)")?;
    let target = args.target.as_deref().context("A tunnel target is required (--target)")?;
    let connector = ProxyTunnelConnector::from_config(proxy, &config.timeouts)?;

    if let Some(server_name) = &args.tls_server_name {
        let ca_file = proxy
            .ca_file
            .as_deref()
            .context("A CA file is required for the TLS handshake (--ca-file)")?;
        let tls = connector
            .connect_tls(target, server_name, tls_client_config(ca_file)?)
            .await?;
        let (tunnel, _) = tls.get_ref();
        println!("tls tunnel established, auth scheme: {}", tunnel.auth_scheme());
        return Ok(());
    }

    let tunnel = connector.connect(target).await?;
    println!("tunnel established, auth scheme: {}", tunnel.auth_scheme());

    if let Some(path) = &args.send_file {
        let sent = send_file(tunnel, path, args.offset, args.length, &config.streaming).await?;
        println!("sent {} bytes through the tunnel", sent);
    }
    Ok(())
}

fn apply_overrides(config: &mut TransportConfig, args: &Args) {
    if let Some(url) = &args.proxy {
        let proxy = config.proxy.get_or_insert_with(|| ProxyConfig {
            proxy_url: url.clone(),
            username: None,
            password: None,
            max_header_size: None,
            ca_file: None,
        });
        proxy.proxy_url = url.clone();
    }
    if let Some(proxy) = config.proxy.as_mut() {
        if args.proxy_username.is_some() {
            proxy.username = args.proxy_username.clone();
        }
        if args.proxy_password.is_some() {
            proxy.password = args.proxy_password.clone();
        }
        if args.ca_file.is_some() {
            proxy.ca_file = args.ca_file.clone();
        }
    }

    let timeouts = &mut config.timeouts;
    timeouts.read_timeout_millis = args.read_timeout.or(timeouts.read_timeout_millis);
    timeouts.write_timeout_millis = args.write_timeout.or(timeouts.write_timeout_millis);
    timeouts.response_timeout_millis = args.response_timeout.or(timeouts.response_timeout_millis);

    if let Some(chunk_size) = args.chunk_size {
        config.streaming.chunk_size = chunk_size;
    }
    if args.max_bytes_per_write.is_some() {
        config.streaming.max_bytes_per_write = args.max_bytes_per_write;
    }
}

async fn send_file(
    tunnel: EstablishedTunnel<TcpStream>,
    path: &Path,
    offset: u64,
    length: Option<u64>,
    streaming: &StreamingConfig,
) -> Result<u64> {
    let channel = BlockingFileChannel::open(path)
        .with_context(|| format!("Cannot open {}", path.display()))?;
    let available = channel.file_len()?.saturating_sub(offset);
    let length = length.map_or(available, |length| length.min(available));

    // Sink writes block, and they run on the blocking pool next to the reads.
    let socket = tunnel.into_inner().into_inner().into_std()?;
    socket.set_nonblocking(false)?;
    let sink = WriteSink::new(socket).with_max_bytes_per_write(streaming.max_bytes_per_write);

    let source = ChunkedFileReadSource::new(Arc::new(channel), streaming.chunk_size, offset, length);
    write_publisher(&source, sink).await?;
    Ok(length)
}

fn sample_config() -> TransportConfig {
    TransportConfig {
        proxy: Some(ProxyConfig {
            proxy_url: "http://proxy.example.com:3128".to_string(),
            username: Some("user".to_string()),
            password: Some("change-me".to_string()),
            max_header_size: Some(16 * 1024),
            ca_file: None,
        }),
        timeouts: TimeoutConfig {
            read_timeout_millis: Some(60_000),
            write_timeout_millis: Some(60_000),
            response_timeout_millis: Some(10_000),
        },
        streaming: StreamingConfig::default(),
        logging: None,
    }
}
