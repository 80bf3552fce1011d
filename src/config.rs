use crate::error::SettingsError;
use crate::llm::{DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_SYSTEM_INSTRUCTION, LlmSettings};
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

/// Default listen address.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default listen port.
pub const DEFAULT_PORT: u16 = 8000;
/// Default directory for the browser client.
pub const DEFAULT_STATIC_DIR: &str = "static";
/// Default maximum request body size (1 MiB).
pub const DEFAULT_BODY_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Address to bind (env: `TARS_SERVER__HOST`)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Directory served as static files
    #[arg(long, env = "STATIC_DIR")]
    pub static_dir: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub static_dir: String,
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            static_dir: DEFAULT_STATIC_DIR.to_string(),
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
        }
    }
}

impl ServerConfig {
    /// `host:port` string for binding.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        // Defaults
        let mut builder = Config::builder()
            .set_default("server.host", DEFAULT_HOST)?
            .set_default("server.port", i64::from(DEFAULT_PORT))?
            .set_default("server.static_dir", DEFAULT_STATIC_DIR)?
            .set_default(
                "server.body_limit_bytes",
                i64::try_from(DEFAULT_BODY_LIMIT_BYTES).unwrap_or(i64::MAX),
            )?;

        // Config file: explicit path must exist, ./config.{yaml,toml,json} is optional
        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path).required(true)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        // Environment variables (prefixed with TARS_), e.g. TARS_SERVER__PORT=9000
        builder = builder.add_source(
            Environment::with_prefix("TARS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // CLI flags (and their plain env fallbacks such as PORT) win over everything
        if let Some(host) = cli.host {
            builder = builder.set_override("server.host", host)?;
        }
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(dir) = cli.static_dir {
            builder = builder.set_override("server.static_dir", dir)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

/// Load model settings from the process environment.
pub fn load_llm_settings() -> Result<LlmSettings, SettingsError> {
    load_llm_settings_from(|key| std::env::var(key).ok())
}

/// Load model settings through an arbitrary variable lookup.
///
/// - `GEMINI_API_KEY`, falling back to `GOOGLE_API_KEY` (required)
/// - `GENAI_MODEL` (default [`DEFAULT_MODEL`])
/// - `GENAI_BASE_URL` (default [`DEFAULT_BASE_URL`])
/// - `GENAI_SYSTEM_INSTRUCTION` (default [`DEFAULT_SYSTEM_INSTRUCTION`])
///
/// Blank values count as unset.
pub fn load_llm_settings_from<F>(lookup: F) -> Result<LlmSettings, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let api_key = var("GEMINI_API_KEY")
        .or_else(|| var("GOOGLE_API_KEY"))
        .ok_or(SettingsError::MissingApiKey)?;

    Ok(LlmSettings {
        api_key,
        model: var("GENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        base_url: var("GENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        system_instruction: Some(
            var("GENAI_SYSTEM_INSTRUCTION")
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
        ),
    })
}
