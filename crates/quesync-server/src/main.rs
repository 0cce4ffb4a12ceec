use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use quesync_files::CHUNK_SIZE;
use quesync_protocol::events::{Event, EventSink};
use quesync_protocol::types::{SessionId, UserId};
use quesync_server::channels::VoiceChannels;
use quesync_server::config::ServerConfig;
use quesync_server::registry::VoiceRegistry;
use quesync_server::relay;
use quesync_server::store::MemoryCallStore;
use quesync_server::transfer::{FileLibrary, SessionAuthorizer, TransferServer};

#[derive(Parser)]
#[command(name = "quesync-server", about = "Quesync real-time communication server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Path to TLS certificate file (PEM), overrides config
    #[arg(long)]
    cert: Option<String>,

    /// Path to TLS private key file (PEM), overrides config
    #[arg(long)]
    key: Option<String>,

    /// TLS port for file transfers, overrides config
    #[arg(long)]
    files_port: Option<u16>,

    /// UDP port for voice traffic, overrides config
    #[arg(long)]
    voice_port: Option<u16>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// Directory for completed uploads, overrides config
    #[arg(long)]
    files_dir: Option<String>,
}

/// Delivery through the external control plane is out of scope for this
/// binary; events are logged instead.
struct LoggingSink;

impl EventSink for LoggingSink {
    fn deliver(&self, event: Event, target: UserId) {
        info!(%target, ?event, "event");
    }
}

/// Standalone-mode authorizer: the control plane issues session ids equal
/// to the user id they belong to.
struct IdentityAuthorizer;

impl SessionAuthorizer for IdentityAuthorizer {
    fn authorize(&self, session_id: SessionId) -> Option<UserId> {
        Some(session_id)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install the ring crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quesync_server=info".into()),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        ServerConfig::default()
    };

    // CLI overrides
    if let Some(cert) = args.cert {
        config.cert_path = cert;
    }
    if let Some(key) = args.key {
        config.key_path = key;
    }
    if let Some(port) = args.files_port {
        config.files_port = port;
    }
    if let Some(port) = args.voice_port {
        config.voice_port = port;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(dir) = args.files_dir {
        config.files_dir = dir;
    }

    info!("Quesync server starting");
    info!(
        host = %config.host,
        session_port = config.session_port,
        voice_port = config.voice_port,
        files_port = config.files_port,
        files_dir = %config.files_dir,
    );

    // Load TLS certificate and key
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")?;

    let tls_acceptor = TlsAcceptor::from(Arc::new(tls_config));

    // Shared state
    let sink = Arc::new(LoggingSink);
    let store = Arc::new(MemoryCallStore::new());
    let registry = Arc::new(VoiceRegistry::new());
    let channels = Arc::new(VoiceChannels::new(store, sink));
    let library = Arc::new(FileLibrary::new(config.files_dir.clone().into()));
    let transfer = Arc::new(TransferServer::new(
        library,
        Arc::new(IdentityAuthorizer),
        CHUNK_SIZE,
    ));

    // Bind the voice socket with large buffers to absorb bursts
    let voice_socket = {
        let sock = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("failed to create UDP socket")?;
        let _ = sock.set_recv_buffer_size(2 * 1024 * 1024); // 2MB
        let _ = sock.set_send_buffer_size(2 * 1024 * 1024); // 2MB
        let addr: std::net::SocketAddr = format!("{}:{}", config.host, config.voice_port)
            .parse()
            .with_context(|| {
                format!("invalid voice address {}:{}", config.host, config.voice_port)
            })?;
        sock.bind(&addr.into()).with_context(|| {
            format!("failed to bind UDP on {}:{}", config.host, config.voice_port)
        })?;
        sock.set_nonblocking(true)
            .context("failed to set non-blocking")?;
        let std_sock: std::net::UdpSocket = sock.into();
        Arc::new(UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?)
    };

    info!("voice socket bound on {}:{}", config.host, config.voice_port);

    // Spawn the voice relay and the pending-invite sweep
    let relay_registry = registry.clone();
    let relay_channels = channels.clone();
    let relay_socket = voice_socket.clone();
    tokio::spawn(async move {
        relay::run_relay_loop(relay_socket, relay_registry, relay_channels).await;
    });
    tokio::spawn(channels.clone().run_sweep_loop());

    // The session port belongs to the external control plane; it is bound
    // here so misconfigured deployments fail fast, but never served.
    let _session_listener =
        TcpListener::bind(format!("{}:{}", config.host, config.session_port))
            .await
            .with_context(|| {
                format!(
                    "failed to bind session port on {}:{}",
                    config.host, config.session_port
                )
            })?;

    // File-transfer accept loop
    let files_listener = TcpListener::bind(format!("{}:{}", config.host, config.files_port))
        .await
        .with_context(|| {
            format!("failed to bind files port on {}:{}", config.host, config.files_port)
        })?;

    info!("server ready, accepting transfer connections");

    loop {
        let (tcp_stream, peer_addr) = match files_listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!("accept error: {}", e);
                continue;
            }
        };

        let tls_acceptor = tls_acceptor.clone();
        let transfer = transfer.clone();

        tokio::spawn(async move {
            match tls_acceptor.accept(tcp_stream).await {
                Ok(tls_stream) => {
                    transfer.handle_connection(tls_stream).await;
                }
                Err(e) => {
                    error!(peer = %peer_addr, "TLS handshake failed: {}", e);
                }
            }
        });
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let cert_data = fs::read(path).with_context(|| format!("failed to read cert: {}", path))?;
    let mut reader = std::io::BufReader::new(cert_data.as_slice());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificates")?;

    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path);
    }

    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let key_data = fs::read(path).with_context(|| format!("failed to read key: {}", path))?;
    let mut reader = std::io::BufReader::new(key_data.as_slice());

    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue, // skip other items
            None => anyhow::bail!("no private key found in {}", path),
        }
    }
}
