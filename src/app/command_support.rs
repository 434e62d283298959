use crate::config::{load_global_settings, load_settings_from, Settings};
use crate::runtime::{bootstrap_state_root, StatePaths};
use std::path::Path;

pub fn load_settings(config_path: Option<&Path>) -> Result<Settings, String> {
    match config_path {
        Some(path) => load_settings_from(path),
        None => load_global_settings(),
    }
    .map_err(|err| err.to_string())
}

pub fn ensure_runtime_root(settings: &Settings) -> Result<StatePaths, String> {
    let root = settings.resolve_state_root().map_err(|e| e.to_string())?;
    let paths = StatePaths::new(root);
    bootstrap_state_root(&paths).map_err(|e| e.to_string())?;
    Ok(paths)
}
