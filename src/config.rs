//! Runtime configuration.
//!
//! Three layers, later ones winning: the `.krillclaw.json` file in the
//! working directory, `KRILLCLAW_*` / API-key environment variables, and
//! command-line flags (applied by the driver). `finalize` resolves the API
//! key for the chosen provider and validates that required settings are
//! present before the loop starts.

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::llm::types::Provider;
use crate::transport::TransportKind;

/// Application state directory, relative to the working directory.
pub const APP_DIR: &str = ".krillclaw";
/// Configuration filename looked up in the working directory.
pub const CONFIG_FILENAME: &str = ".krillclaw.json";
/// Key-value store directory under [`APP_DIR`].
pub const KV_DIR: &str = "kv";
/// Bridge sidecar socket under [`APP_DIR`], used by the BLE carrier.
pub const BRIDGE_SOCKET: &str = "bridge.sock";
/// Sandbox working directory under [`APP_DIR`] (sandbox builds).
pub const SANDBOX_DIR: &str = "sandbox";

pub const DEFAULT_MAX_TOKENS: u64 = 4096;
pub const DEFAULT_MAX_CONTEXT_TOKENS: usize = 65_536;
pub const DEFAULT_MAX_TURNS: usize = 10;
pub const DEFAULT_SERIAL_BAUD: u32 = 115_200;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are KrillClaw, a small autonomous agent. \
Use the available tools to act on the user's request, observe the results, \
and keep going until the task is done. Be concise.";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    pub max_tokens: u64,
    pub max_context_tokens: usize,
    pub max_turns: usize,
    pub system_prompt: String,
    pub streaming: bool,
    pub transport: TransportKind,
    pub ble_device: Option<String>,
    pub serial_port: Option<String>,
    pub serial_baud: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            provider: Provider::Claude,
            model: String::new(),
            base_url: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            streaming: true,
            transport: TransportKind::Http,
            ble_device: None,
            serial_port: None,
            serial_baud: DEFAULT_SERIAL_BAUD,
        }
    }
}

/// On-disk shape of `.krillclaw.json`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    model: Option<String>,
    provider: Option<Provider>,
    max_tokens: Option<u64>,
    max_turns: Option<usize>,
    system_prompt: Option<String>,
    base_url: Option<String>,
    streaming: Option<bool>,
}

impl Config {
    /// Load defaults, then the config file, then the environment. CLI flags
    /// are merged on top by the driver, which then calls [`Config::finalize`].
    pub fn load() -> Self {
        let mut config = Config::default();
        config.apply_file(std::path::Path::new(CONFIG_FILENAME));
        config.apply_env();
        config
    }

    fn apply_file(&mut self, path: &std::path::Path) {
        let Ok(text) = std::fs::read_to_string(path) else {
            return;
        };
        match serde_json::from_str::<FileConfig>(&text) {
            Ok(file) => {
                if let Some(model) = file.model {
                    self.model = model;
                }
                if let Some(provider) = file.provider {
                    self.provider = provider;
                }
                if let Some(max_tokens) = file.max_tokens {
                    self.max_tokens = max_tokens;
                }
                if let Some(max_turns) = file.max_turns {
                    self.max_turns = max_turns;
                }
                if let Some(system_prompt) = file.system_prompt {
                    self.system_prompt = system_prompt;
                }
                if let Some(base_url) = file.base_url {
                    self.base_url = Some(base_url);
                }
                if let Some(streaming) = file.streaming {
                    self.streaming = streaming;
                }
            }
            Err(e) => log::warn!("ignoring malformed {}: {e}", path.display()),
        }
    }

    fn apply_env(&mut self) {
        // OPENAI_API_KEY alone selects the openai provider; an explicit
        // KRILLCLAW_PROVIDER below still wins.
        if env_nonempty("ANTHROPIC_API_KEY").is_none() {
            if env_nonempty("OPENAI_API_KEY").is_some() {
                self.provider = Provider::OpenAiStyle;
            }
        }
        if let Some(v) = env_nonempty("KRILLCLAW_MODEL") {
            self.model = v;
        }
        if let Some(v) = env_nonempty("KRILLCLAW_PROVIDER") {
            if let Some(p) = Provider::parse(&v) {
                self.provider = p;
            } else {
                log::warn!("unknown KRILLCLAW_PROVIDER {v:?}");
            }
        }
        if let Some(v) = env_nonempty("KRILLCLAW_MAX_TOKENS") {
            match v.parse() {
                Ok(n) => self.max_tokens = n,
                Err(_) => log::warn!("unparseable KRILLCLAW_MAX_TOKENS {v:?}"),
            }
        }
        if let Some(v) = env_nonempty("KRILLCLAW_BASE_URL") {
            self.base_url = Some(v);
        }
        if let Some(v) = env_nonempty("KRILLCLAW_SYSTEM_PROMPT") {
            self.system_prompt = v;
        }
        if let Some(v) = env_nonempty("KRILLCLAW_TRANSPORT") {
            if let Some(t) = TransportKind::parse(&v) {
                self.transport = t;
            } else {
                log::warn!("unknown KRILLCLAW_TRANSPORT {v:?}");
            }
        }
        if let Some(v) = env_nonempty("KRILLCLAW_SERIAL_PORT") {
            self.serial_port = Some(v);
            self.transport = TransportKind::Serial;
        }
        if let Some(v) = env_nonempty("KRILLCLAW_BLE_DEVICE") {
            self.ble_device = Some(v);
            self.transport = TransportKind::Ble;
        }
    }

    /// Resolve the API key and defaults for the final provider choice and
    /// reject configurations that cannot reach an endpoint.
    pub fn finalize(&mut self) -> Result<()> {
        if self.model.is_empty() {
            self.model = default_model(self.provider).to_string();
        }
        if self.api_key.is_empty() {
            let var = match self.provider {
                Provider::Claude => Some("ANTHROPIC_API_KEY"),
                Provider::OpenAiStyle => Some("OPENAI_API_KEY"),
                Provider::Ollama => None,
            };
            if let Some(var) = var {
                if let Some(key) = env_nonempty(var) {
                    self.api_key = key;
                }
            }
        }
        if !self.provider.supports_streaming() {
            self.streaming = false;
        }
        if self.requires_api_key() && self.api_key.is_empty() {
            bail!(
                "no API key for provider {}; set {} or use --base-url for a keyless endpoint",
                self.provider,
                match self.provider {
                    Provider::OpenAiStyle => "OPENAI_API_KEY",
                    _ => "ANTHROPIC_API_KEY",
                }
            );
        }
        if self.transport == TransportKind::Serial && self.serial_port.is_none() {
            bail!("--transport serial requires --serial-port");
        }
        Ok(())
    }

    fn requires_api_key(&self) -> bool {
        match self.provider {
            Provider::Claude => true,
            // A base-url override usually points at a keyless local server.
            Provider::OpenAiStyle => self.base_url.is_none(),
            Provider::Ollama => false,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.provider.default_base_url().to_string())
    }

    /// Directory for persisted state (KV entries, bridge socket, sandbox).
    pub fn app_dir(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(APP_DIR)
    }
}

pub fn default_model(provider: Provider) -> &'static str {
    match provider {
        Provider::Claude => "claude-sonnet-4-5",
        Provider::OpenAiStyle => "gpt-4o-mini",
        Provider::Ollama => "llama3.2",
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}
