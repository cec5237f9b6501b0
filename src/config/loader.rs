// Configuration file loading and creation

use super::types::Config;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Get the path to the configuration file
pub fn get_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push("tictactoe-net");

    // Create config directory if it doesn't exist
    fs::create_dir_all(&path).ok();

    path.push("config.toml");
    path
}

/// Load configuration from file, or create default if it doesn't exist
pub fn load_config() -> Result<Config, io::Error> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config, io::Error> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        Ok(parse_config(&contents))
    } else {
        create_default_config(path)?;
        Ok(Config::default())
    }
}

/// Parse TOML text; a malformed file falls back to defaults
pub fn parse_config(contents: &str) -> Config {
    match toml::from_str(contents) {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to parse config file, using defaults: {}", e);
            Config::default()
        }
    }
}

/// Create a default configuration file with helpful comments
pub fn create_default_config(path: &Path) -> Result<(), io::Error> {
    let config = Config::default();
    let toml_string =
        toml::to_string_pretty(&config).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let commented_toml = format!(
        "# tictactoe-net configuration\n\
         # Restart the game after editing\n\
         #\n\
         # [local]  direct play on the same network (host listens on default_port)\n\
         # [relay]  internet play through a relay server; leave server_url empty\n\
         #          to disable it\n\
         #\n\
         # Timeouts of 0 mean \"wait forever\"\n\n\
         {}",
        toml_string
    );

    fs::write(path, commented_toml)?;
    info!("Created default config file at: {}", path.display());
    Ok(())
}
