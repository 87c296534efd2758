#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

use std::env;
use std::path;

use anyhow::bail;
use anyhow::Result;
use clap::ArgMatches;
use clap::Command;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use strum::EnumIter;
use strum::EnumVariantNames;
use strum::IntoEnumIterator;
use tokio::fs;

static CONFIG: Lazy<DashMap<String, String>> = Lazy::new(DashMap::new);

#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumIter, EnumVariantNames, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ConfigKey {
    Agent,
    ConfigFile,
    CreateTimeout,
    Directory,
    HeartbeatInterval,
    Model,
    PollBatchSize,
    PollInterval,
    PromptRetries,
    ReconnectBaseDelay,
    ReconnectMaxAttempts,
    ReconnectMaxDelay,
    RefreshDebounce,
    ServerUrl,
    SessionID,
    StateFile,
    Transport,
}

impl ConfigKey {
    /// Keys whose values must be whole numbers.
    pub fn is_numeric(&self) -> bool {
        return matches!(
            self,
            ConfigKey::CreateTimeout
                | ConfigKey::HeartbeatInterval
                | ConfigKey::PollBatchSize
                | ConfigKey::PollInterval
                | ConfigKey::PromptRetries
                | ConfigKey::ReconnectBaseDelay
                | ConfigKey::ReconnectMaxAttempts
                | ConfigKey::ReconnectMaxDelay
                | ConfigKey::RefreshDebounce
        );
    }
}

fn home_dir() -> path::PathBuf {
    return dirs::home_dir().unwrap_or_else(env::temp_dir);
}

pub struct Config {}

impl Config {
    pub fn get(key: ConfigKey) -> String {
        if let Some(val) = CONFIG.get(&key.to_string()) {
            return val.to_string();
        }

        return "".to_string();
    }

    pub fn set(key: ConfigKey, value: &str) {
        CONFIG.insert(key.to_string(), value.to_string());
    }

    /// Reads a numeric key, falling back to its default when the stored
    /// value is missing or unreadable.
    pub fn get_number(key: ConfigKey) -> u64 {
        let fallback = Config::default(key).parse::<u64>().unwrap_or_default();
        return Config::get(key).parse::<u64>().unwrap_or(fallback);
    }

    pub fn default(key: ConfigKey) -> String {
        #[cfg(not(target_os = "macos"))]
        let config_path = dirs::config_dir()
            .unwrap_or_else(home_dir)
            .join("parley/config.toml");
        #[cfg(target_os = "macos")]
        let config_path = home_dir().join(".config/parley/config.toml");

        let state_path = dirs::cache_dir()
            .unwrap_or_else(home_dir)
            .join("parley/state.yaml");

        let directory = env::current_dir()
            .map(|e| return e.to_string_lossy().to_string())
            .unwrap_or_default();

        let res = match key {
            ConfigKey::Agent => "build",
            ConfigKey::CreateTimeout => "30000",
            ConfigKey::HeartbeatInterval => "30000",
            ConfigKey::Model => "",
            ConfigKey::PollBatchSize => "10",
            ConfigKey::PollInterval => "1000",
            ConfigKey::PromptRetries => "3",
            ConfigKey::ReconnectBaseDelay => "1000",
            ConfigKey::ReconnectMaxAttempts => "10",
            ConfigKey::ReconnectMaxDelay => "30000",
            ConfigKey::RefreshDebounce => "500",
            ConfigKey::ServerUrl => "http://localhost:4096",
            ConfigKey::Transport => "sse",

            // Special
            ConfigKey::ConfigFile => return config_path.to_string_lossy().to_string(),
            ConfigKey::Directory => return directory,
            ConfigKey::SessionID => "",
            ConfigKey::StateFile => return state_path.to_string_lossy().to_string(),
        };

        return res.to_string();
    }

    pub async fn load(cmd: Command, clap_arg_matches: Vec<&ArgMatches>) -> Result<()> {
        for key in ConfigKey::iter() {
            Config::set(key, &Config::default(key))
        }

        let mut config_file = Config::default(ConfigKey::ConfigFile);
        for matches in clap_arg_matches.as_slice() {
            if let Ok(Some(arg_config_file)) =
                matches.try_get_one::<String>(&ConfigKey::ConfigFile.to_string())
            {
                config_file = arg_config_file.to_string();
            }
        }

        let config_path = path::PathBuf::from(config_file);
        if config_path.exists() {
            let toml_str = fs::read_to_string(config_path).await?;
            let doc = toml_str.parse::<toml_edit::Document>()?;

            for key in ConfigKey::iter() {
                if let Some(val) = doc.get(&key.to_string()) {
                    // Use clap value parsers to do validation.
                    let mut possible_values = vec![];
                    if let Some(arg) = cmd
                        .get_arguments()
                        .find(|e| return e.get_long() == Some(key.to_string().as_str()))
                    {
                        possible_values = arg
                            .get_possible_values()
                            .iter()
                            .map(|e| return e.get_name().to_string())
                            .collect::<Vec<String>>();
                    }

                    if let Some(val_int) = val.as_integer() {
                        Config::set(key, &val_int.to_string());
                    } else if let Some(val_str) = val.as_str() {
                        if val_str.is_empty() {
                            continue;
                        }
                        if !possible_values.is_empty()
                            && !possible_values.contains(&val_str.to_string())
                        {
                            bail!(format!("config.toml has an invalid value for key '{key}': {val_str}\nPossible values are: {}", possible_values.join(", ")));
                        }
                        if key.is_numeric() && val_str.parse::<u64>().is_err() {
                            bail!(format!("config.toml has an invalid value for key '{key}': {val_str}\nExpected a whole number"));
                        }
                        Config::set(key, val_str);
                    }
                }
            }
        }

        for key in ConfigKey::iter() {
            for matches in clap_arg_matches.as_slice() {
                if let Ok(Some(val)) = matches.try_get_one::<String>(&key.to_string()) {
                    if val.is_empty() {
                        continue;
                    }
                    Config::set(key, val)
                }
            }
        }

        tracing::debug!(
            server_url = Config::get(ConfigKey::ServerUrl),
            directory = Config::get(ConfigKey::Directory),
            agent = Config::get(ConfigKey::Agent),
            model = Config::get(ConfigKey::Model),
            transport = Config::get(ConfigKey::Transport),
            state_file = Config::get(ConfigKey::StateFile),
            "config"
        );

        return Ok(());
    }

    pub fn serialize_default(cmd: Command) -> String {
        let toml_str = ConfigKey::iter()
            .filter_map(|key| {
                if key == ConfigKey::SessionID || key == ConfigKey::ConfigFile {
                    return None;
                }

                let arg = cmd
                    .get_arguments()
                    .find(|e| return e.get_long() == Some(key.to_string().as_str()))?;

                let mut description = arg
                    .get_help()
                    .map(|e| return e.to_string())
                    .unwrap_or_default();

                description = description
                    .split("[default:")
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();

                if !arg.get_possible_values().is_empty() {
                    let possible_values = arg
                        .get_possible_values()
                        .iter()
                        .map(|e| return e.get_name())
                        .collect::<Vec<_>>()
                        .join(", ");
                    description = format!("{description} [possible values: {}]", possible_values);
                }

                // Machine specific, so left for the user to fill in.
                let mut val = match key {
                    ConfigKey::Directory | ConfigKey::StateFile => "".to_string(),
                    _ => Config::default(key),
                };
                if val.is_empty() {
                    val = format!("# {key} = \"\"");
                } else if val.parse::<u64>().is_ok() {
                    val = format!("{key} = {val}");
                } else {
                    val = format!("{key} = \"{val}\"");
                }

                return Some(format!("# {description}\n{val}"));
            })
            .collect::<Vec<String>>()
            .join("\n\n");

        return toml_str;
    }
}
