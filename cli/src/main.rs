//! pkgguard CLI: batch package lookups and manifest uploads.
//!
//! # Commands
//! ```text
//! pkgguard batch   --purl <purl>... | --file <list.txt> [--chunk-size N] [--concurrency N] [--alerts]
//! pkgguard upload  --org <slug> [--root <dir>] <files>...
//! pkgguard version
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use pkgguard_core::BatchResult;
use pkgguard_http::{ClientConfig, SecurityClient};

#[derive(Parser)]
#[command(
    name = "pkgguard",
    about = "Package security lookups and manifest uploads",
    long_about = "
pkgguard: query package security data in bulk and upload dependency manifests.

ENVIRONMENT VARIABLES:
  PKGGUARD_API_TOKEN   API token (required)
  PKGGUARD_API_URL     Service root (default: https://api.pkgguard.dev/v0)
  RUST_LOG             Log filter, e.g. pkgguard_core=debug
",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override PKGGUARD_API_URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up package URLs; prints one JSON result per line
    Batch {
        /// Package URL, e.g. pkg:npm/express@4.19.2 (repeatable)
        #[arg(long = "purl")]
        purls: Vec<String>,
        /// File with one purl per line ('#' starts a comment)
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Requests in flight
        #[arg(long)]
        concurrency: Option<usize>,
        /// Include alert details
        #[arg(long)]
        alerts: bool,
    },

    /// Upload manifest files as a new full scan
    Upload {
        /// Organization slug
        #[arg(long)]
        org: String,
        /// Files are named relative to this directory
        #[arg(long, default_value = ".")]
        root: PathBuf,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Batch {
            purls,
            file,
            chunk_size,
            concurrency,
            alerts,
        } => {
            let client = client(cli.api_url)?;
            cmd_batch(&client, purls, file.as_deref(), chunk_size, concurrency, alerts).await
        }

        Commands::Upload { org, root, files } => {
            let client = client(cli.api_url)?;
            cmd_upload(&client, &org, &root, &files).await
        }

        Commands::Version => {
            println!("pkgguard v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn client(api_url: Option<String>) -> Result<SecurityClient> {
    let mut config = ClientConfig::from_env();
    if let Some(url) = api_url {
        config = config.with_base_url(url);
    }
    if config.api_token.is_none() {
        bail!("PKGGUARD_API_TOKEN is not set");
    }
    SecurityClient::new(config).context("failed to create client")
}

async fn cmd_batch(
    client: &SecurityClient,
    mut purls: Vec<String>,
    file: Option<&Path>,
    chunk_size: Option<usize>,
    concurrency: Option<usize>,
    alerts: bool,
) -> Result<()> {
    if let Some(path) = file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        purls.extend(read_purl_list(&text));
    }
    if purls.is_empty() {
        bail!("no purls given; use --purl or --file");
    }

    let mut options = client.config().batch_config();
    if let Some(n) = chunk_size {
        options.chunk_size = n;
    }
    if let Some(n) = concurrency {
        options.concurrency = n;
    }
    let query = if alerts {
        vec![("alerts".to_string(), "true".to_string())]
    } else {
        Vec::new()
    };

    let mut results = client.batch_packages_with(purls, options, query);
    let mut failed = 0usize;
    while let Some(item) = results.next().await {
        let result = item.context("batch lookup aborted")?;
        if let BatchResult::Failure { chunk, error, .. } = &result {
            tracing::warn!(chunk, %error, "chunk failed");
            failed += 1;
        }
        println!("{}", serde_json::to_string(&result.to_json())?);
    }

    let stats = results.stats();
    tracing::info!(
        chunks = stats.chunks_total,
        failed = stats.chunks_failed,
        records = stats.records,
        "batch complete"
    );
    if failed > 0 {
        bail!("{failed} chunk(s) failed");
    }
    Ok(())
}

async fn cmd_upload(client: &SecurityClient, org: &str, root: &Path, files: &[PathBuf]) -> Result<()> {
    let scan = client
        .upload_manifest_files(org, root, files)
        .await
        .with_context(|| format!("upload to '{org}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&scan)?);
    Ok(())
}

fn read_purl_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purl_list_skips_comments_and_blanks() {
        let text = "# deps\npkg:npm/a@1\n\n  pkg:npm/b@2  \n#pkg:npm/c@3\n";
        assert_eq!(read_purl_list(text), vec!["pkg:npm/a@1", "pkg:npm/b@2"]);
    }

    #[test]
    fn parses_batch_flags() {
        let cli = Cli::try_parse_from([
            "pkgguard",
            "batch",
            "--purl",
            "pkg:npm/a@1",
            "--purl",
            "pkg:npm/b@2",
            "--chunk-size",
            "50",
            "--alerts",
        ])
        .unwrap();
        match cli.command {
            Commands::Batch {
                purls,
                chunk_size,
                alerts,
                ..
            } => {
                assert_eq!(purls.len(), 2);
                assert_eq!(chunk_size, Some(50));
                assert!(alerts);
            }
            _ => panic!("expected batch"),
        }
    }

    #[test]
    fn upload_requires_files() {
        assert!(Cli::try_parse_from(["pkgguard", "upload", "--org", "acme"]).is_err());
    }
}
