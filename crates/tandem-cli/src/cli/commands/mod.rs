mod dispatch;
pub mod runner;
pub mod worker;

pub use dispatch::dispatch;

use crate::exit_codes;
use std::path::Path;
use tandem_core::EngineConfig;

/// Finished-operation marker in the synthetic messages the worker sends.
pub(crate) const FINISHED_KIND: &str = "finished";

/// `--config` file if given, otherwise defaults plus `TANDEM_*` overrides.
/// Errors map to the config exit code.
pub(crate) fn load_config(path: Option<&Path>) -> Result<EngineConfig, i32> {
    let loaded = match path {
        Some(path) => EngineConfig::from_yaml_file(path),
        None => EngineConfig::from_env(),
    };
    loaded.map_err(|e| {
        eprintln!("config error: {e}");
        exit_codes::CONFIG_ERROR
    })
}
