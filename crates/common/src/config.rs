use std::env;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn from_env() -> Self {
        match env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_environment_defaults_to_development() {
        // SAFETY: serialized test, no other thread reads the environment.
        unsafe { env::remove_var("ENVIRONMENT") };
        assert_eq!(Environment::from_env(), Environment::Development);
    }

    #[test]
    #[serial]
    fn test_environment_parses_production_aliases() {
        for value in ["production", "prod", "PRODUCTION", "Prod"] {
            // SAFETY: serialized test, no other thread reads the environment.
            unsafe { env::set_var("ENVIRONMENT", value) };
            assert_eq!(
                Environment::from_env(),
                Environment::Production,
                "{value} should select production"
            );
        }
        unsafe { env::remove_var("ENVIRONMENT") };
    }

    #[test]
    #[serial]
    fn test_environment_round_trips_as_str() {
        assert_eq!(Environment::Development.as_str(), "development");
        assert_eq!(Environment::Production.as_str(), "production");
    }
}
