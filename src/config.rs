//! Loading of the engine configuration.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use blockwise_engine::Config;
use tracing::debug;

/// The name of the configuration file looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "blockwise.toml";

/// Reads a configuration file from the specified path.
pub fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).with_context(|| {
        format!(
            "failed to read configuration file `{path}`",
            path = path.display()
        )
    })?;

    toml::from_str(&text).with_context(|| {
        format!(
            "failed to parse configuration file `{path}`",
            path = path.display()
        )
    })
}

/// Loads and validates the engine configuration.
///
/// If no path is given, `blockwise.toml` in the working directory is used if
/// it exists; otherwise the default configuration is used.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => read_config(path)?,
        None if Path::new(CONFIG_FILE_NAME).is_file() => {
            debug!("using configuration file `{CONFIG_FILE_NAME}`");
            read_config(Path::new(CONFIG_FILE_NAME))?
        }
        None => Config::default(),
    };

    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockwise.toml");
        fs::write(&path, "max_jobs = 8\nblock_shape = [10, 10]\n").unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.max_jobs, 8);
        assert_eq!(config.block_shape, vec![10, 10]);
    }

    #[test]
    fn invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockwise.toml");
        fs::write(&path, "max_jobs = 0\n").unwrap();

        let e = load(Some(&path)).unwrap_err();
        assert_eq!(e.to_string(), "invalid configuration");
        assert_eq!(
            e.root_cause().to_string(),
            "configuration value `max_jobs` cannot be zero"
        );
    }

    #[test]
    fn missing_file() {
        let e = load(Some(Path::new("/nonexistent/blockwise.toml"))).unwrap_err();
        assert!(e.to_string().starts_with("failed to read configuration file"));
    }
}
