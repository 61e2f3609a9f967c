//! Configuration file discovery and loading

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::info;

use rolesync_core::Config;

use crate::error::{CliError, CliResult};

const FILE_NAMES: [&str; 2] = ["rolesync.yml", "rolesync.yaml"];
const SYSTEM_CONFIG: &str = "/etc/rolesync.yml";

/// Where the configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Stdin,
    File(PathBuf),
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Stdin => f.write_str("<stdin>"),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Candidate paths, in lookup order.
pub fn candidates(cwd: &Path, config_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = FILE_NAMES.iter().map(|name| cwd.join(name)).collect();
    if let Some(dir) = config_dir {
        paths.push(dir.join("rolesync").join("rolesync.yml"));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG));
    paths
}

/// Pick the configuration source. An explicit path must exist.
pub fn discover(explicit: Option<&Path>, cwd: &Path, config_dir: Option<&Path>) -> CliResult<ConfigSource> {
    if let Some(path) = explicit {
        if path == Path::new("-") {
            return Ok(ConfigSource::Stdin);
        }
        if !path.is_file() {
            return Err(CliError::ConfigNotFound {
                searched: vec![path.to_path_buf()],
            });
        }
        return Ok(ConfigSource::File(path.to_path_buf()));
    }

    let searched = candidates(cwd, config_dir);
    searched
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .map(ConfigSource::File)
        .ok_or(CliError::ConfigNotFound { searched })
}

/// Discover from the process environment.
pub fn discover_default(explicit: Option<&Path>) -> CliResult<ConfigSource> {
    let cwd = std::env::current_dir()?;
    discover(explicit, &cwd, dirs::config_dir().as_deref())
}

/// Read and normalize the configuration.
pub fn load(source: &ConfigSource) -> CliResult<Config> {
    let config = match source {
        ConfigSource::Stdin => {
            let mut text = String::new();
            std::io::stdin().read_to_string(&mut text)?;
            Config::from_yaml_str(&text)?
        }
        ConfigSource::File(path) => Config::load(path)?,
    };
    info!(
        source = %source,
        items = config.sync_map.len(),
        "Loaded configuration"
    );
    Ok(config)
}
