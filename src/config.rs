use std::{
    collections::BTreeMap,
    env,
    fs::{self, OpenOptions},
    io::{Read, Seek, Write},
    path::PathBuf,
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

/// A named connection string.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub connection_string: String,

    #[serde(skip)]
    pub name: String,
}

/// Configuration options for the whole application.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            String::from("default"),
            Profile {
                connection_string: String::from("Data Source=:memory:"),
                name: String::from("default"),
            },
        );
        Config { profiles }
    }
}

impl Config {
    /// Parses a configuration document, filling in profile names from their keys.
    pub fn from_json(json: &[u8]) -> anyhow::Result<Config> {
        let mut config: Config = serde_json::from_slice(json)?;
        for (name, profile) in config.profiles.iter_mut() {
            profile.name = name.clone();
        }
        Ok(config)
    }

    pub fn profile(&self, name: &str) -> anyhow::Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| anyhow!("profile not found: {}", name))
    }
}

/// Directory holding `config.json`: `$SQCONN_HOME` when set, otherwise `sqconn` under the
/// platform configuration directory. Created on first use.
#[tracing::instrument(err)]
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let dir = env::var_os("SQCONN_HOME")
        .map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|base| base.join("sqconn")))
        .context("no configuration directory for this platform, set SQCONN_HOME")?;

    fs::create_dir_all(&dir)
        .with_context(|| format!("unable to create {}", dir.to_string_lossy()))?;
    Ok(dir)
}

/// Loads the configuration from the configuration file, creating it with default values if it
/// does not exist.
#[tracing::instrument(err)]
pub fn load() -> anyhow::Result<Config> {
    let mut path = config_dir()?;
    path.push("config.json");
    load_from(path)
}

#[tracing::instrument(skip_all, fields(path = %path.to_string_lossy()), err)]
fn load_from(path: PathBuf) -> anyhow::Result<Config> {
    let mut options = OpenOptions::new();
    options.read(true);
    options.write(true);
    options.create(true);

    tracing::info!("Loading configuration from {}", path.to_string_lossy());
    let mut file = options.open(&path)?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    if buf.is_empty() || buf.iter().all(u8::is_ascii_whitespace) {
        tracing::info!("File is empty, writing default configuration");
        file.set_len(0)?;
        file.rewind()?;
        buf = serde_json::to_vec_pretty(&Config::default())?;
        file.write_all(&buf)?;
        file.flush()?
    }

    Config::from_json(&buf)
}
