use std::path::Path;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "contract-cli";

/// Everything the CLI needs beyond the engine's own `Config`: the REPL
/// prompt and whether to print timing after non-interactive runs.
/// Loaded the way `kv-cli`'s `ConfigLoad` is: built-in defaults, then an
/// optional TOML file (via `confy`), then environment overrides, each
/// layer only overriding what the previous one set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigLoad {
    pub prompt: String,
    pub show_stats: bool,
    /// Whether calls are charged stamps against the signer's currency
    /// balance. Off by default: a freshly started CLI has no genesis
    /// supply to charge against, so every call would fail `submission`'s
    /// balance check before it ever ran. Flip this on once a currency
    /// contract has been deployed and funded.
    pub metering: bool,
    pub engine: contract_core::config::Config,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            prompt: DEFAULT_PROMPT.to_string(),
            show_stats: false,
            metering: false,
            engine: contract_core::config::Config::default(),
        }
    }
}

impl ConfigLoad {
    /// Layers a TOML file over the defaults, then environment variables
    /// over that. A missing file is not an error; a malformed one is.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut cfg: ConfigLoad = confy::load_path(path.as_ref()).unwrap_or_default();
        cfg.apply_env();
        cfg.engine.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CONTRACT_CLI_PROMPT") {
            self.prompt = v;
        }
        if let Ok(v) = std::env::var("CONTRACT_CLI_DEFAULT_STAMPS") {
            if let Ok(n) = v.parse() {
                self.engine.default_stamps = n;
            }
        }
        if let Ok(v) = std::env::var("CONTRACT_CLI_METERING") {
            if let Ok(b) = v.parse() {
                self.metering = b;
            }
        }
    }

    /// REPL mode shows timing after each command; non-interactive runs
    /// don't unless asked, matching `kv-cli`'s `terminal_update`.
    pub fn terminal_update(&mut self) {
        self.show_stats = true;
    }
}
