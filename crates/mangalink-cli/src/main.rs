use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use mangalink_core::{
    ContentService, ControlSession, HostContent, RemoteContentClient, SessionConfig, Shelf,
};
use storage::{ContentTree, LocalContentTree};
use transport::memory::{MemoryConnection, DEFAULT_MAX_MESSAGE_SIZE};

#[derive(Parser, Debug)]
#[command(name = "mangalink", version, about = "MangaLink peer-to-peer content sharing")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Session config file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Largest frame the loopback transport carries
    #[arg(long, global = true, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show a content root as a Host would share it
    List {
        /// Content root directory
        root: PathBuf,
    },

    /// Fetch one file through a loopback Host/Client pair
    Fetch {
        /// Content root directory
        root: PathBuf,

        /// Episode to load
        #[arg(long, default_value_t = 0)]
        scope: u32,

        /// File index within the episode
        #[arg(long, default_value_t = 0)]
        index: u32,

        /// Write the fetched bytes here
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Walk every episode as a Client sees it
    Browse {
        /// Content root directory
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Commands::List { root } => list_content(&root).await?,

        Commands::Fetch {
            root,
            scope,
            index,
            output,
        } => {
            let link = Loopback::start(&root, &cfg, cli.max_message_size).await?;
            let result = fetch_file(&link.client, scope, index, output.as_deref()).await;
            link.host.shutdown();
            result?;
        }

        Commands::Browse { root } => {
            let link = Loopback::start(&root, &cfg, cli.max_message_size).await?;
            let result = browse(&link.client).await;
            link.host.shutdown();
            result?;
        }
    }

    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mangalink").join("config.json"))
}

fn load_config(explicit: Option<&Path>) -> Result<SessionConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(SessionConfig::default()),
        },
    };

    let cfg_json = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let cfg: SessionConfig = serde_json::from_str(&cfg_json)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(cfg)
}

fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

/// A Host and a Client joined by an in-process connection.
struct Loopback {
    host: ControlSession,
    client: RemoteContentClient,
}

impl Loopback {
    async fn start(root: &Path, cfg: &SessionConfig, max_message_size: usize) -> Result<Self> {
        let tree = Arc::new(LocalContentTree::new(root.to_path_buf())?);
        let service = Arc::new(ContentService::open(tree, cfg).await?);

        let (host_conn, client_conn) = MemoryConnection::pair(max_message_size);
        let (host, _) = ControlSession::host(Arc::new(host_conn), service, cfg);
        let (client, _) = RemoteContentClient::connect(Arc::new(client_conn), cfg);

        client
            .session()
            .wait_ready()
            .await
            .context("Control channel never opened")?;
        tracing::info!("Loopback session ready over {}", root.display());
        Ok(Self { host, client })
    }
}

async fn list_content(root: &Path) -> Result<()> {
    let tree = LocalContentTree::new(root.to_path_buf())?;
    let content = HostContent::open(&tree).await?;
    let view = content.view();

    println!("{:?}: {}", view.content_type(), view.title());
    match &content {
        HostContent::Manga { episodes, .. } => {
            for (scope, episode) in episodes.iter().enumerate() {
                let files = tree.list_files(&episode.path).await?;
                println!("  [{}] {} ({} files)", scope, episode.name, files.len());
            }
        }
        HostContent::SingleCollection { dir, .. } => {
            for (index, file) in tree.list_files(dir).await?.iter().enumerate() {
                println!("  [{}] {}", index, file.name);
            }
        }
    }

    Ok(())
}

async fn fetch_file(
    client: &RemoteContentClient,
    scope: u32,
    index: u32,
    output: Option<&Path>,
) -> Result<()> {
    let files = client.load_episode(scope).await?;
    println!("Episode {} has {} file(s)", scope, files);

    let data = client.fetch_file(index).await?;
    println!("✓ Fetched file {} ({} bytes)", index, data.len());
    println!("  SHA-256: {}", sha256_hex(&data));

    if let Some(path) = output {
        tokio::fs::write(path, &data)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("  Written to: {}", path.display());
    }

    Ok(())
}

async fn browse(client: &RemoteContentClient) -> Result<()> {
    let meta = client.wait_meta().await?;
    println!("{}", serde_json::to_string_pretty(&meta)?);

    let view = client
        .view()
        .context("Host is not sharing any content")?;
    println!("{:?}: {}", view.content_type(), view.title());

    for scope in 0..view.episode_count() as u32 {
        let episode = client.episode(scope).await?;
        println!("  [{}] {} ({} files)", scope, episode.name, episode.length);
    }

    Ok(())
}
