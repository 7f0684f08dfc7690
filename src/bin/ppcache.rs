use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use postproc_cache::{CacheConfig, CacheManager, KeyGenerator, RelationshipInput};

#[derive(Parser)]
#[command(name = "ppcache")]
#[command(about = "Inspect and maintain the post-processing result cache", long_about = None)]
struct Cli {
    /// Override the key version tag (PP_CACHE_VERSION)
    #[arg(long, global = true)]
    cache_version: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the cache key for a chunk's relationships
    Key {
        /// Chunk identifier
        chunk_id: String,

        /// JSON array of relationships ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        relationships: PathBuf,

        /// File with the chunk text, folded into the key
        #[arg(short, long)]
        content: Option<PathBuf>,
    },

    /// Show occupancy of the configured backend
    Stats {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Remove entries whose key matches a glob
    Clear {
        /// Key glob (`*` and `?`)
        #[arg(short, long, default_value = "*")]
        pattern: String,
    },

    /// Remove expired entries and enforce the size limit once
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "postproc_cache=info,ppcache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = CacheConfig::from_env().context("invalid PP_CACHE_* configuration")?;
    if let Some(version) = cli.cache_version {
        config.version = version;
    }

    match cli.command {
        Commands::Key {
            chunk_id,
            relationships,
            content,
        } => {
            let relationships = read_relationships(&relationships)?;
            let content = content
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading content from {:?}", path))
                })
                .transpose()?;

            let key = KeyGenerator::new(config.version.clone())
                .with_content_hash(content.is_some())
                .generate(&chunk_id, &relationships, content.as_deref())?;
            println!("{}", key);
        }

        Commands::Stats { json } => {
            let cache = CacheManager::connect(config).await?;
            let stats = cache.stats().await;

            if json {
                let summary = serde_json::json!({
                    "backend": cache.backend().kind().to_string(),
                    "version": &cache.config().version,
                    "entries": stats.entries,
                    "size_bytes": stats.size_bytes,
                    "max_total_size": cache.config().max_total_size,
                });
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Backend:  {}", cache.backend().kind());
                println!("Version:  {}", cache.config().version);
                println!("Entries:  {}", fmt_opt(stats.entries));
                println!(
                    "Size:     {} / {} bytes",
                    fmt_opt(stats.size_bytes),
                    cache.config().max_total_size
                );
            }
        }

        Commands::Clear { pattern } => {
            let cache = CacheManager::connect(config).await?;
            let removed = cache.clear(&pattern).await?;
            println!("Removed {} entries matching {:?}", removed, pattern);
        }

        Commands::Sweep => {
            let cache = CacheManager::connect(config).await?;
            let report = cache.sweep().await?;
            println!(
                "Expired: {}, evicted: {}, size: {} -> {} bytes",
                report.expired.len(),
                report.evicted.len(),
                report.size_before,
                report.size_after
            );
        }
    }

    Ok(())
}

fn read_relationships(path: &Path) -> Result<Vec<RelationshipInput>> {
    let raw = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading relationships from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?
    };

    serde_json::from_str(&raw).context("relationships must be a JSON array")
}

fn fmt_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "unknown".to_string())
}
