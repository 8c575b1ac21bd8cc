mod session;

use std::{env, error::Error, net::SocketAddr, path::PathBuf, sync::Arc};

use groupie_utils::{
    load_config_or_default, Config, DirectoryConfig, Directory, DispatchPolicy, Dispatcher,
    DkimVerifier, LogNotifier, MemoryDirectory, Notifier, NotifierConfig, Pipeline,
    SmtpNotifier, SqliteDirectory,
};
use session::LmtpSession;
use tokio::{
    io::{split, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_PATH: &str = "config.toml";

/// Main function for the LMTP server.
///
/// Loads the configuration, builds the command pipeline and listens
/// for incoming connections, each one handled in its own task by
/// [`handle_lmtp_session`], until ctrl-c is received.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config_path: PathBuf = env::args()
        .nth(1)
        .or_else(|| env::var("GROUPIE_CONFIG").ok())
        .unwrap_or_else(|| CONFIG_PATH.to_string())
        .into();
    let config = load_config_or_default(&config_path)?;
    info!(path = %config_path.display(), "Configuration loaded");
    if config.commands.domains.is_empty() {
        warn!("No administrative domains configured, every command will be rejected");
    }

    let pipeline = Arc::new(build_pipeline(&config).await?);

    let host = env::var("HOST").unwrap_or_else(|_| config.lmtp.host.clone());
    let port: u16 = match env::var("PORT") {
        Ok(port) => port.parse()?,
        Err(_) => config.lmtp.port,
    };
    let listening = format!("{host}:{port}");
    let listener = TcpListener::bind(&listening).await?;
    info!(address = %listening, "Groupie LMTP running");

    let hostname: Arc<str> = config.lmtp.hostname.as_str().into();
    let max_message_size = config.lmtp.max_message_size;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let pipeline = pipeline.clone();
                let hostname = hostname.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        handle_lmtp_session(stream, peer, pipeline, &hostname, max_message_size).await
                    {
                        warn!(peer = %peer, error = %e, "LMTP session failed");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, no longer accepting connections");
                break;
            }
        }
    }
    Ok(())
}

/// Builds the verifier, directory and notifier named in the configuration
/// and wires them into a [`Pipeline`].
async fn build_pipeline(config: &Config) -> Result<Pipeline, Box<dyn Error>> {
    let verifier = Arc::new(DkimVerifier::new()?);

    let directory: Arc<dyn Directory> = match &config.directory {
        DirectoryConfig::Memory => Arc::new(MemoryDirectory::new()),
        DirectoryConfig::Sqlite { path } => Arc::new(SqliteDirectory::open(path).await?),
    };
    let notifier: Arc<dyn Notifier> = match &config.notifier {
        NotifierConfig::Log => Arc::new(LogNotifier),
        NotifierConfig::Smtp { relay, port, from } => {
            Arc::new(SmtpNotifier::new(relay, *port, from.clone()))
        }
    };
    info!(
        directory = directory.name(),
        notifier = notifier.name(),
        "Group backends initialized"
    );

    let policy: DispatchPolicy = config.dispatch_policy();
    let dispatcher = Dispatcher::new(directory, notifier, policy);
    Ok(Pipeline::new(verifier, config.commands.parser(), dispatcher)
        .with_required_headers(config.verification.required_headers())
        .with_local_senders(config.groups.require_local_senders))
}

async fn handle_lmtp_session(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<Pipeline>,
    hostname: &str,
    max_message_size: usize,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    stream.set_nodelay(true)?;
    info!(peer = %peer, "Connection accepted");

    let (reader, mut writer) = split(stream);
    let mut reader = BufReader::new(reader);
    let mut session =
        LmtpSession::new(pipeline, hostname, max_message_size).with_client_ip(peer.ip());
    session.handle(&mut reader, &mut writer).await?;
    Ok(())
}
