use anyhow::{anyhow, Context, Result};
use ddx_core::config::{get_default_config_file, DdxConfig};
use std::path::{Path, PathBuf};

// Get path to the configuration file, honouring --config
pub fn get_config_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(path) => Ok(path.to_path_buf()),
        None => get_default_config_file("ddx").context("Could not locate the default config file"),
    }
}

pub fn load(path: &Path) -> Result<DdxConfig> {
    DdxConfig::load_from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

// Effective configuration as TOML; defaults when the file does not exist
pub fn show_config(path: &Path) -> Result<String> {
    let config = load(path)?;
    toml::to_string_pretty(&config).context("Failed to render configuration")
}

pub fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    DdxConfig::default()
        .save_to_file(path)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ddx").join("config.toml");
        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
        assert_eq!(load(&path).unwrap(), DdxConfig::default());
    }

    #[test]
    fn test_show_missing_file_prints_defaults() {
        let dir = tempdir().unwrap();
        let shown = show_config(&dir.path().join("none.toml")).unwrap();
        assert!(shown.contains("port = 4388"));
        assert!(shown.contains("[tls]"));
    }

    #[test]
    fn test_custom_path_wins() {
        let path = PathBuf::from("/tmp/elsewhere.toml");
        assert_eq!(get_config_path(Some(&path)).unwrap(), path);
    }
}
