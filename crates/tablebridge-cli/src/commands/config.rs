use std::path::Path;

use tablebridge_core::config::{self, BridgeConfig};

pub fn cmd_config(args: &[String]) -> i32 {
    match args.first().map(|s| s.as_str()) {
        Some("path") => config_path(),
        Some("show") => config_show(),
        Some("init") => match config::config_path() {
            Some(path) => config_init(&path, args.get(1).map(|s| s.as_str()) == Some("--force")),
            None => {
                eprintln!("Cannot determine config path.");
                1
            }
        },
        _ => {
            eprintln!("Usage: tablebridge config <path|show|init>");
            eprintln!("  path           Print config file path");
            eprintln!("  show           Print the effective config");
            eprintln!("  init [--force] Create config with defaults");
            1
        }
    }
}

fn config_path() -> i32 {
    match config::config_path() {
        Some(p) => {
            println!("{}", p.display());
            0
        }
        None => {
            eprintln!("Cannot determine config path.");
            1
        }
    }
}

fn config_show() -> i32 {
    let config = match BridgeConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    match toml::to_string_pretty(&config) {
        Ok(text) => {
            print!("{text}");
            0
        }
        Err(e) => {
            eprintln!("Failed to render config: {e}");
            1
        }
    }
}

fn config_init(path: &Path, force: bool) -> i32 {
    if path.exists() && !force {
        eprintln!("Config file already exists: {}", path.display());
        eprintln!("Use --force to overwrite.");
        return 1;
    }

    if let Err(e) = BridgeConfig::default().save_to(path) {
        eprintln!("Failed to write config: {e}");
        return 1;
    }
    println!("Created config: {}", path.display());
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_without_subcommand_returns_error() {
        assert_eq!(cmd_config(&[]), 1);
        assert_eq!(cmd_config(&["edit".into()]), 1);
    }

    #[test]
    fn init_writes_defaults_and_respects_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(config_init(&path, false), 0);
        let loaded = BridgeConfig::load_from(&path).unwrap();
        assert_eq!(loaded, BridgeConfig::default());

        assert_eq!(config_init(&path, false), 1);
        assert_eq!(config_init(&path, true), 0);
    }
}
