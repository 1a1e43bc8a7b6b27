mod config;
mod load;

pub use config::*;
pub use load::{load_config, load_config_file, parse_config};
