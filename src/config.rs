use crate::registry::RegistryOptions;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// Local directory holding the model artifacts
    #[arg(long, env = "ARTIFACTS_DIR", default_value = "models")]
    pub artifacts_dir: PathBuf,

    /// Hugging Face Hub repository to fetch missing artifacts from
    #[arg(long, env = "HUB_REPO")]
    pub hub_repo: Option<String>,

    /// JSON manifest mapping artifact filenames to download URLs
    #[arg(long, env = "URL_MANIFEST")]
    pub url_manifest: Option<PathBuf>,

    /// Skip the pre-flight artifact fetch entirely
    #[arg(long, env = "SKIP_FETCH")]
    pub skip_fetch: bool,

    /// Fetch artifacts and exit without starting the server
    #[arg(long)]
    pub fetch_only: bool,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Maximum sequence length for transformer tokenization
    #[arg(long, env = "MAX_SEQUENCE_LENGTH", default_value = "512")]
    pub max_sequence_length: usize,

    /// Serve the classical models only, without the transformer
    #[arg(long, env = "NO_BERT")]
    pub no_bert: bool,
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            artifacts_dir: self.artifacts_dir.clone(),
            enable_bert: !self.no_bert,
            cpu: self.cpu_only,
            max_sequence_length: self.max_sequence_length,
        }
    }
}
