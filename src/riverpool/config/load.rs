use std::path::{Path, PathBuf};
use tracing::{info_span, info, debug};
use std::env;
use std::borrow::Cow;
use regex::{Regex, Captures};

use crate::riverpool::{Error, Result};
use crate::riverpool::config::config::Settings;


/// Load configuration settings from riverpool.yaml
/// Searching in order:
/// 1) config_path passed as first command line argument
/// 2) Current directory
/// 3) Any parent directory of the current directory, up to root
/// 4) ~/.config/riverpool/
/// 5) ~/
/// 6) /etc/riverpool/
///
/// This replaces ${ENV_VAR[:DEFAULT]} parameters in the yaml file with values from the environment
/// variable, if set, otherwise, optionally with the given default value after the :
pub fn load_config(config_name: &str) -> Result<Settings> {
    let _span = info_span!("loading config file").entered();
    let config_path = find_config_file(config_name)?;
    info!(config_path = %config_path.to_string_lossy().into_owned(), "found config file");
    load_config_file(config_path)
}

/// load_config_file parses and validates the config file at config_path
pub fn load_config_file(config_path: PathBuf) -> Result<Settings> {
    let raw_yaml = std::fs::read_to_string(&config_path)?;
    parse_config(&raw_yaml, config_path)
}

/// parse_config substitutes environment variables in raw_yaml, then parses and validates it
pub fn parse_config(raw_yaml: &str, config_path: PathBuf) -> Result<Settings> {
    let yaml_text = replace_env_vars(raw_yaml)?;
    let mut config: Settings = serde_yaml::from_str(&yaml_text)?;
    config.load(config_path)?;
    Ok(config)
}

fn find_config_file(config_name: &str) -> Result<PathBuf> {
    // Use the full path given as the first command line argument
    if let Some(path) = env::args().nth(1) {
        debug!("using config_path passed on command line");
        return Ok(PathBuf::from(path));
    }

    // Check the current directory or any of its parents for config_name
    if let Ok(start) = env::current_dir() {
        let mut dir = start.as_path();
        while !dir.as_os_str().is_empty() {
            debug!("checking for config file in {}", dir.to_string_lossy());
            let fp = Path::join(dir, config_name);
            if fp.exists() {
                return Ok(fp);
            }
            if let Some(parent) = dir.parent() {
                dir = parent;
            } else {
                break;
            }
        }
    }

    // HOME is required to be set on POSIX systems, but if it's not set we'll try ~/
    let home = env::var("HOME").unwrap_or_else(|_| "~/".to_string());
    let candidates = [
        Path::new(&home).join(".config/riverpool").join(config_name),
        Path::new(&home).join(".".to_string() + config_name),
        Path::new("/etc/riverpool").join(config_name),
    ];
    for conf_path in candidates {
        debug!("checking for config file in {}", conf_path.to_string_lossy());
        if conf_path.exists() {
            return Ok(conf_path);
        }
    }

    Err(Error::new(format!("config file {} not found", config_name)))
}

pub(crate) fn replace_env_vars(raw_yaml: &str) -> Result<Cow<str>> {
    let re_var = Regex::new(r"\$\{([a-zA-Z_][0-9a-zA-Z_]*)(?::([^}]+?))?\}").map_err(Error::new)?;

    let mut errors = Vec::<String>::new();

    let replaced_text = re_var.replace_all(raw_yaml, |caps: &Captures| {
        match env::var(&caps[1]) {
            Ok(val) => val,
            Err(_) => {
                if let Some(default) = caps.get(2) {
                    let s = default.as_str();
                    if let Some(message) = s.strip_prefix('?') {
                        errors.push(message.to_string());
                        String::new()
                    } else {
                        s.to_string()
                    }
                } else {
                    errors.push(format!("environment variable {} is required but not defined", &caps[1]));
                    String::new()
                }
            }
        }
    });

    if errors.is_empty() {
        Ok(replaced_text)
    } else {
        Err(Error::new(errors.join("\n")))
    }
}
