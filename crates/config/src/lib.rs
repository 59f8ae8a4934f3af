use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub db_dir: Option<PathBuf>,
    pub vault: Vault,
    #[serde(default)]
    pub sync: Sync,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Vault {
    pub addr: Url,
    pub token: String,
    pub transit_key: String,
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Sync {
    #[serde(default = "default_safety_margin")]
    pub safety_margin: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown: humantime_serde::Serde<Duration>,
    #[serde(default = "default_pass_interval")]
    pub pass_interval: humantime_serde::Serde<Duration>,
}

impl Default for Sync {
    fn default() -> Self {
        Self {
            safety_margin: default_safety_margin(),
            cooldown: default_cooldown(),
            pass_interval: default_pass_interval(),
        }
    }
}

fn default_safety_margin() -> u64 {
    3
}

fn default_cooldown() -> humantime_serde::Serde<Duration> {
    Duration::from_secs(5).into()
}

fn default_pass_interval() -> humantime_serde::Serde<Duration> {
    Duration::from_secs(1).into()
}
