//! TOML config parsing for the coordinator's tunables.

/// Builds a config struct from its `Default` values, then overwrites the
/// listed fields from a TOML string if one is given. Keys outside the listed
/// fields are rejected so a misspelled knob never silently falls back to its
/// default.
///
/// Example:
/// ```no_run
/// # use cohort::{parsed_config, CohortError, ManagerConfig};
/// # fn main() -> Result<(), CohortError> {
/// # let config_str: Option<&str> = None;
/// let config = parsed_config!(config_str => ManagerConfig;
///                             replication_group_size, probe_timeout_ms)?;
/// # let _ = config;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        let compose_config = || -> Result<$config_type, $crate::CohortError> {
            let mut config: $config_type = Default::default();
            let mut table = match config_str {
                Some(s) => s.parse::<toml::Table>()?,
                None => return Ok(config),
            };

            $(
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            )+

            // leftover keys were not asked for
            if let Some(key) = table.keys().next() {
                return Err($crate::CohortError::msg(format!(
                    "invalid field name '{}' in config",
                    key,
                )));
            }
            Ok(config)
        };

        compose_config()
    }};
}
