use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Load settings of type `T` from an optional `base` file inside `config_dir`
/// (any format the `config` crate understands) overlaid with `APP_`-prefixed
/// environment variables, e.g. `APP_JWT__SECRET`. Keys named in `list_keys`
/// accept comma-separated values from the environment.
pub fn load<T: DeserializeOwned>(
    config_dir: Option<&Path>,
    list_keys: &[&str],
) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let mut builder = Cfg::builder();

    if let Some(dir) = config_dir {
        let base = dir.join("base");
        if let Some(base) = base.to_str() {
            builder = builder.add_source(File::with_name(base).required(false));
        }
    }

    let mut environment = Environment::with_prefix("APP")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true);

    if !list_keys.is_empty() {
        environment = environment.list_separator(",");
        for key in list_keys {
            environment = environment.with_list_parse_key(key);
        }
    }

    let settings = builder.add_source(environment).build()?;

    Ok(settings.try_deserialize()?)
}
