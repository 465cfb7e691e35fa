use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8001
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SecurityConfig {
    /// Empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_filter() -> String {
    "info,lesson_gateway=debug".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LessonsConfig {
    /// Project root holding the numbered module directories.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_entry_file")]
    pub entry_file: String,
    /// Directories (relative to `root`) scanned by the catalog builder.
    #[serde(default = "default_catalog_dirs")]
    pub catalog_dirs: Vec<PathBuf>,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,
    #[serde(default = "default_pricing_path")]
    pub pricing_path: PathBuf,
    #[serde(default = "default_skip_markers")]
    pub skip_markers: Vec<String>,
}

impl Default for LessonsConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            entry_file: default_entry_file(),
            catalog_dirs: default_catalog_dirs(),
            catalog_path: default_catalog_path(),
            pricing_path: default_pricing_path(),
            skip_markers: default_skip_markers(),
        }
    }
}

impl LessonsConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_entry_file() -> String {
    "main.py".into()
}

fn default_catalog_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("07_real_world")]
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("gui/backend/data/agent_catalog.json")
}

fn default_pricing_path() -> PathBuf {
    PathBuf::from("gui/backend/data/pricing.json")
}

fn default_skip_markers() -> Vec<String> {
    vec!["__pycache__".into(), "_template".into()]
}

/// How a run's working directory expectations are honoured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkdirPolicy {
    /// The lesson directory is handed to the agent; the process cwd is untouched.
    #[default]
    Explicit,
    /// The process cwd is switched for the duration of the run under a global lock.
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Empty runs the runner bundled with the gateway.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variable the project root is prepended to in the child.
    #[serde(default = "default_search_path_env")]
    pub search_path_env: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub workdir: WorkdirPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            search_path_env: default_search_path_env(),
            timeout_secs: None,
            max_concurrency: default_max_concurrency(),
            workdir: WorkdirPolicy::default(),
        }
    }
}

fn default_program() -> String {
    "python3".into()
}

fn default_search_path_env() -> String {
    "PYTHONPATH".into()
}

fn default_max_concurrency() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub module: String,
    pub class: String,
    pub default_model: String,
    pub api_key_env: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub warning: Option<String>,
    /// Local providers (e.g. ollama) run without a key.
    #[serde(default = "default_requires_key")]
    pub requires_key: bool,
}

fn default_requires_key() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelsConfig {
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "builtin_providers")]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default = "default_openrouter_models_url")]
    pub openrouter_models_url: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            providers: builtin_providers(),
            openrouter_models_url: default_openrouter_models_url(),
        }
    }
}

fn default_provider() -> String {
    "openrouter".into()
}

fn default_openrouter_models_url() -> String {
    "https://openrouter.ai/api/v1/models".into()
}

fn provider(
    module: &str,
    class: &str,
    default_model: &str,
    api_key_env: &str,
    description: &str,
    capabilities: &[&str],
) -> ProviderConfig {
    ProviderConfig {
        module: module.into(),
        class: class.into(),
        default_model: default_model.into(),
        api_key_env: api_key_env.into(),
        description: description.into(),
        capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
        warning: None,
        requires_key: true,
    }
}

pub fn builtin_providers() -> BTreeMap<String, ProviderConfig> {
    let full = ["tools", "structured_output", "streaming", "vision"];
    let mut table = BTreeMap::new();
    table.insert(
        "openrouter".into(),
        provider(
            "agno.models.openrouter",
            "OpenRouter",
            "anthropic/claude-haiku-4.5",
            "OPENROUTER_API_KEY",
            "Multi-model access via OpenRouter",
            &full,
        ),
    );
    table.insert(
        "openai".into(),
        provider(
            "agno.models.openai",
            "OpenAIChat",
            "gpt-4o",
            "OPENAI_API_KEY",
            "OpenAI GPT models",
            &full,
        ),
    );
    table.insert(
        "anthropic".into(),
        provider(
            "agno.models.anthropic",
            "Claude",
            "claude-sonnet-4-5",
            "ANTHROPIC_API_KEY",
            "Anthropic Claude models",
            &full,
        ),
    );
    table.insert(
        "google".into(),
        provider(
            "agno.models.google",
            "Gemini",
            "gemini-2.5-flash",
            "GOOGLE_AI_API_KEY",
            "Google Gemini models",
            &full,
        ),
    );
    let mut cerebras = provider(
        "agno.models.cerebras",
        "Cerebras",
        "llama-3.3-70b",
        "CEREBRAS_API_KEY",
        "Ultra-fast inference (chat only, no tools)",
        &["streaming"],
    );
    cerebras.warning = Some("Cerebras only supports basic chat. Agents with tools will fail.".into());
    table.insert("cerebras".into(), cerebras);
    table.insert(
        "groq".into(),
        provider(
            "agno.models.groq",
            "Groq",
            "llama-3.3-70b-versatile",
            "GROQ_API_KEY",
            "Fast inference via Groq",
            &["tools", "streaming"],
        ),
    );
    let mut ollama = provider(
        "agno.models.ollama",
        "Ollama",
        "llama3.2",
        "OLLAMA_HOST",
        "Local models via Ollama",
        &["tools", "streaming"],
    );
    ollama.requires_key = false;
    table.insert("ollama".into(), ollama);
    let mut huggingface = provider(
        "agno.models.huggingface",
        "HuggingFace",
        "meta-llama/Llama-3.3-70B-Instruct",
        "HUGGINGFACE_API_KEY",
        "Open-source models via HuggingFace",
        &["streaming"],
    );
    huggingface.warning = Some("Tool support varies by model. Basic chat recommended.".into());
    table.insert("huggingface".into(), huggingface);
    table
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub lessons: LessonsConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)
            .map_err(|err| GatewayError::Protocol(format!("Failed to parse configuration: {err}")))?;
        Ok(cfg)
    }

    /// Loads `path` when it exists (defaults otherwise) and applies `GATEWAY_*` overrides.
    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            Self::from_file(path)?
        } else {
            Self::default()
        };
        if let Ok(host) = env::var("GATEWAY_HOST") {
            cfg.server.host = host;
        }
        if let Ok(port) = env::var("GATEWAY_PORT") {
            if let Ok(parsed) = port.parse::<u16>() {
                cfg.server.port = parsed;
            }
        }
        if let Ok(root) = env::var("GATEWAY_LESSONS_ROOT") {
            cfg.lessons.root = PathBuf::from(root);
        }
        if let Ok(catalog) = env::var("GATEWAY_CATALOG_PATH") {
            cfg.lessons.catalog_path = PathBuf::from(catalog);
        }
        if let Ok(pricing) = env::var("GATEWAY_PRICING_PATH") {
            cfg.lessons.pricing_path = PathBuf::from(pricing);
        }
        if let Ok(program) = env::var("GATEWAY_RUNNER_PROGRAM") {
            cfg.runner.program = program;
        }
        if let Ok(timeout) = env::var("GATEWAY_RUNNER_TIMEOUT") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                cfg.runner.timeout_secs = Some(parsed);
            }
        }
        if let Ok(concurrency) = env::var("GATEWAY_MAX_CONCURRENCY") {
            if let Ok(parsed) = concurrency.parse::<usize>() {
                cfg.runner.max_concurrency = parsed.max(1);
            }
        }
        if let Ok(workdir) = env::var("GATEWAY_WORKDIR_POLICY") {
            cfg.runner.workdir = match workdir.to_ascii_lowercase().as_str() {
                "process" => WorkdirPolicy::Process,
                _ => WorkdirPolicy::Explicit,
            };
        }
        if let Ok(provider) = env::var("GATEWAY_DEFAULT_PROVIDER") {
            cfg.models.default_provider = provider;
        }
        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            cfg.log.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            };
        }
        Ok(cfg)
    }
}

/// Reads `export KEY="value"` lines and sets each key that is not already present.
/// Returns how many keys were loaded; a missing file loads nothing.
pub fn load_secrets_file(path: impl AsRef<Path>) -> usize {
    let Ok(raw) = fs::read_to_string(path) else {
        return 0;
    };
    let mut loaded = 0;
    for (key, value) in parse_exports(&raw) {
        if env::var_os(&key).is_none() {
            env::set_var(&key, value);
            loaded += 1;
        }
    }
    loaded
}

fn parse_exports(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.strip_prefix("export "))
        .filter_map(|rest| rest.split_once('='))
        .filter_map(|(key, value)| {
            let key = key.trim();
            let value = value.trim();
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            (!key.is_empty()).then(|| (key.to_string(), unquoted.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nhost='127.0.0.1'\nport=9000\n[runner]\nprogram='python3.12'\nworkdir='process'"
        )
        .unwrap();

        env::set_var("GATEWAY_PORT", "9100");
        let cfg = AppConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("GATEWAY_PORT");

        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.runner.program, "python3.12");
        assert_eq!(cfg.runner.workdir, WorkdirPolicy::Process);
        assert_eq!(cfg.lessons.entry_file, "main.py");
        assert!(cfg.models.providers.contains_key("openrouter"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = AppConfig::from_env_or_file("/definitely/not/here.toml").unwrap();
        assert_eq!(cfg.runner.max_concurrency, 32);
        assert_eq!(cfg.models.default_provider, "openrouter");
        assert!(!cfg.models.providers["ollama"].requires_key);
    }

    #[test]
    fn example_config_parses() {
        let cfg: AppConfig = toml::from_str(include_str!("../gateway.toml.example")).unwrap();
        assert_eq!(cfg.security.allowed_origins, vec!["http://localhost:3000"]);
        assert!(cfg.runner.args.is_empty());
        assert_eq!(cfg.runner.workdir, WorkdirPolicy::Explicit);
        assert_eq!(cfg.models.providers.len(), 8);
    }

    #[test]
    fn parses_export_lines() {
        let parsed = parse_exports(
            "# comment\nexport A_KEY=\"sk-1\"\nexport B_KEY='two'\nexport C_KEY=plain\nNOT_EXPORTED=1\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("A_KEY".to_string(), "sk-1".to_string()),
                ("B_KEY".to_string(), "two".to_string()),
                ("C_KEY".to_string(), "plain".to_string()),
            ]
        );
    }
}
