use crate::models::file_item::ServerKey;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::{collections::HashMap, env, fmt, str::FromStr, time::Duration};

/// Connection settings of one S3-compatible backend.
#[derive(Clone, PartialEq)]
pub struct BackendSettings {
    pub host: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub use_ssl: bool,
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("host", &self.host)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub default_server: ServerKey,
    pub default_bucket: String,
    pub backend_timeout: Duration,
    pub presign_max_ttl: Duration,
    pub max_upload_bytes: usize,
    pub memory_backends: bool,
    /// Backends with a configured host, by server key.
    pub backends: HashMap<ServerKey, BackendSettings>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Site file storage service")]
pub struct Args {
    /// Host to bind to (overrides SITE_STORAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SITE_STORAGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides SITE_STORAGE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Backend used for new top-level nodes (overrides SITE_STORAGE_DEFAULT_SERVER)
    #[arg(long)]
    pub default_server: Option<String>,

    /// Bucket used for new top-level nodes (overrides SITE_STORAGE_DEFAULT_BUCKET)
    #[arg(long)]
    pub default_bucket: Option<String>,

    /// Deadline of each backend call in seconds (overrides SITE_STORAGE_BACKEND_TIMEOUT_SECS)
    #[arg(long)]
    pub backend_timeout_secs: Option<u64>,

    /// Longest lifetime of a pre-signed URL (overrides SITE_STORAGE_PRESIGN_MAX_TTL_SECS)
    #[arg(long)]
    pub presign_max_ttl_secs: Option<u64>,

    /// Largest accepted upload body (overrides SITE_STORAGE_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Keep objects in process memory instead of talking to S3
    #[arg(long)]
    pub memory_backends: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::resolve(args, |name| env::var(name).ok())
    }

    /// Merge `args` over the variables visible through `lookup`, over defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<(Self, bool)> {
        let env_host = lookup("SITE_STORAGE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "SITE_STORAGE_PORT", 3000u16)?;
        let env_db = lookup("SITE_STORAGE_DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/site_storage.db".into());
        let env_server = parse_var(&lookup, "SITE_STORAGE_DEFAULT_SERVER", ServerKey::S1)?;
        let env_bucket =
            lookup("SITE_STORAGE_DEFAULT_BUCKET").unwrap_or_else(|| "site-files".into());
        let env_timeout = parse_var(&lookup, "SITE_STORAGE_BACKEND_TIMEOUT_SECS", 30u64)?;
        let env_presign = parse_var(&lookup, "SITE_STORAGE_PRESIGN_MAX_TTL_SECS", 604_800u64)?;
        let env_upload = parse_var(&lookup, "SITE_STORAGE_MAX_UPLOAD_BYTES", 100 * 1024 * 1024usize)?;
        let env_memory = parse_var(&lookup, "SITE_STORAGE_MEMORY_BACKENDS", false)?;

        let default_server = match args.default_server {
            Some(value) => value
                .parse::<ServerKey>()
                .map_err(|err| anyhow!("parsing --default-server: {}", err))?,
            None => env_server,
        };

        let mut backends = HashMap::new();
        for server in ServerKey::ALL {
            if let Some(settings) = backend_settings(&lookup, server)? {
                backends.insert(server, settings);
            }
        }

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            default_server,
            default_bucket: args.default_bucket.unwrap_or(env_bucket),
            backend_timeout: Duration::from_secs(args.backend_timeout_secs.unwrap_or(env_timeout)),
            presign_max_ttl: Duration::from_secs(args.presign_max_ttl_secs.unwrap_or(env_presign)),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_upload),
            memory_backends: args.memory_backends || env_memory,
            backends,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read `SITE_STORAGE_{S1|S2|S3}_*`. A backend without a host is not configured.
fn backend_settings(
    lookup: &impl Fn(&str) -> Option<String>,
    server: ServerKey,
) -> Result<Option<BackendSettings>> {
    let var = |suffix: &str| format!("SITE_STORAGE_{}_{}", server.as_str(), suffix);
    let Some(host) = lookup(&var("HOST")) else {
        return Ok(None);
    };

    Ok(Some(BackendSettings {
        host,
        access_key: lookup(&var("ACCESS_KEY")).unwrap_or_default(),
        secret_key: lookup(&var("SECRET_KEY")).unwrap_or_default(),
        region: lookup(&var("REGION")).unwrap_or_else(|| "us-east-1".into()),
        use_ssl: parse_var(lookup, &var("USE_SSL"), true)?,
    }))
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .parse::<T>()
            .map_err(|err| anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let (cfg, migrate) = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert!(!migrate);
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.default_server, ServerKey::S1);
        assert_eq!(cfg.default_bucket, "site-files");
        assert_eq!(cfg.backend_timeout, Duration::from_secs(30));
        assert!(cfg.backends.is_empty());
    }

    #[test]
    fn args_override_env() {
        let args = Args {
            port: Some(9000),
            default_server: Some("s2".into()),
            ..Args::default()
        };
        let env = env_of(&[
            ("SITE_STORAGE_PORT", "8000"),
            ("SITE_STORAGE_DEFAULT_BUCKET", "assets"),
        ]);
        let (cfg, _) = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.default_server, ServerKey::S2);
        assert_eq!(cfg.default_bucket, "assets");
    }

    #[test]
    fn backends_are_read_per_server_key() {
        let env = env_of(&[
            ("SITE_STORAGE_S1_HOST", "s3.example.com"),
            ("SITE_STORAGE_S1_ACCESS_KEY", "ak"),
            ("SITE_STORAGE_S1_SECRET_KEY", "TOPSECRET"),
            ("SITE_STORAGE_S3_HOST", "minio.local:9000"),
            ("SITE_STORAGE_S3_USE_SSL", "false"),
        ]);
        let (cfg, _) = AppConfig::resolve(Args::default(), env).unwrap();
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.backends[&ServerKey::S1].access_key, "ak");
        assert!(cfg.backends[&ServerKey::S1].use_ssl);
        assert!(!cfg.backends[&ServerKey::S3].use_ssl);
        assert!(!cfg.backends.contains_key(&ServerKey::S2));
        assert!(!format!("{:?}", cfg.backends[&ServerKey::S1]).contains("TOPSECRET"));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = AppConfig::resolve(Args::default(), env_of(&[("SITE_STORAGE_PORT", "http")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("SITE_STORAGE_PORT"));
    }
}
