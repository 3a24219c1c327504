mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    AccepterSettings, AdmissionSettings, BrokerSettings, ConnectionSettings, LoggingSettings,
    ResolverSettings, ServerSettings, Settings, TransportKind, millis,
};

/// Prefix of environment variables overriding the configuration, e.g.
/// `SWITCHYARD_SERVER__PORT=9000`.
pub const ENV_PREFIX: &str = "SWITCHYARD";

/// Loads the configuration from `config/default` and environment variables,
/// merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Loads the configuration from the file at `path` (extension optional, file optional)
/// and environment variables, merged over the default values.
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("broker.topics")
                .with_list_parse_key("admission.blacklist")
                .with_list_parse_key("admission.whitelist"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
