//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(VigilError)` on parser failure.
///
/// Example:
/// ```no_run
/// let config = parsed_config!(config_str => LeaseConfig; lease_duration_ms)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, VigilError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err(VigilError(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod tests {
    use crate::utils::VigilError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        duration_ms: u64,
        target: String,
        ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                duration_ms: 30000,
                target: "fabric:lease".into(),
                ratio: 0.25,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), VigilError> {
        let config = parsed_config!(None => TestConfig; duration_ms, target, ratio)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), VigilError> {
        let config_str = Some("duration_ms = 5000");
        let config = parsed_config!(config_str => TestConfig; duration_ms, ratio)?;
        let ref_config = TestConfig {
            duration_ms: 5000,
            target: "fabric:lease".into(),
            ratio: 0.25,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("bogus = 999");
        assert!(parsed_config!(config_str => TestConfig; duration_ms).is_err());
    }
}
