use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::env;

/// Which blob backend holds upload payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackendKind {
    /// Plain files under the storage directory, opened in append mode.
    Local,
    /// Append-blob semantics driven through an `AppendBlobClient`.
    AppendBlob,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments; the upload protocol
/// receives these values once at construction, never from globals.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Reject uploads whose declared total exceeds this many bytes.
    /// `None` means unlimited.
    pub max_bytes: Option<i64>,
    /// Sessions expire this many seconds after creation.
    pub expiration_secs: u64,
    /// Reject chunks that arrive without a Content-Range header. Off by
    /// default: common upload clients skip the header for single-chunk files.
    pub fail_if_no_header: bool,
    /// Require and verify a whole-file MD5 on completion.
    pub do_checksum_check: bool,
    pub storage_backend: StorageBackendKind,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked upload service")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where upload payloads are stored (overrides CHUNKED_UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum declared upload size in bytes (overrides CHUNKED_UPLOAD_MAX_BYTES; unset = unlimited)
    #[arg(long)]
    pub max_bytes: Option<i64>,

    /// Session lifetime in seconds (overrides CHUNKED_UPLOAD_EXPIRATION_SECS)
    #[arg(long)]
    pub expiration_secs: Option<u64>,

    /// Reject chunks without a Content-Range header (overrides CHUNKED_UPLOAD_FAIL_IF_NO_HEADER)
    #[arg(long)]
    pub fail_if_no_header: bool,

    /// Skip the MD5 verification on completion (overrides CHUNKED_UPLOAD_DO_CHECKSUM_CHECK)
    #[arg(long)]
    pub no_checksum_check: bool,

    /// Storage backend for payloads (overrides CHUNKED_UPLOAD_STORAGE_BACKEND)
    #[arg(long, value_enum)]
    pub storage_backend: Option<StorageBackendKind>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_EXPIRATION_SECS: u64 = 24 * 60 * 60;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("CHUNKED_UPLOAD_PORT")?.unwrap_or(3000u16);
        let env_storage =
            env::var("CHUNKED_UPLOAD_STORAGE_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("CHUNKED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/chunked_upload.db".into());
        let env_max_bytes = parse_env::<i64>("CHUNKED_UPLOAD_MAX_BYTES")?;
        let env_expiration =
            parse_env("CHUNKED_UPLOAD_EXPIRATION_SECS")?.unwrap_or(DEFAULT_EXPIRATION_SECS);
        let env_fail_if_no_header =
            parse_env("CHUNKED_UPLOAD_FAIL_IF_NO_HEADER")?.unwrap_or(false);
        let env_checksum = parse_env("CHUNKED_UPLOAD_DO_CHECKSUM_CHECK")?.unwrap_or(true);
        let env_backend = match env::var("CHUNKED_UPLOAD_STORAGE_BACKEND") {
            Ok(value) => Some(
                StorageBackendKind::from_str(&value, true)
                    .map_err(|err| anyhow::anyhow!("parsing CHUNKED_UPLOAD_STORAGE_BACKEND: {err}"))?,
            ),
            Err(_) => None,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            max_bytes: args.max_bytes.or(env_max_bytes),
            expiration_secs: args.expiration_secs.unwrap_or(env_expiration),
            fail_if_no_header: args.fail_if_no_header || env_fail_if_no_header,
            do_checksum_check: !args.no_checksum_check && env_checksum,
            storage_backend: args
                .storage_backend
                .or(env_backend)
                .unwrap_or(StorageBackendKind::Local),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an optional environment variable, keeping the variable
/// name in the error message.
fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).context(format!("reading {}", name)),
    }
}
