//! Fns to read variables from the environment more conveniently. Values are read once, when a
//! [`crate::config::MigrationConfig`] is built, and never consulted again afterwards.

use std::env;

use tracing::debug;

/// Get an environment variable, encoding found or missing as Option, and panic otherwise.
pub fn get_env_var(key: &str) -> Option<String> {
    let var = match env::var(key) {
        Err(env::VarError::NotPresent) => None,
        Err(e) => panic!("{e}"),
        Ok(var) => Some(var),
    };

    if let Some(ref existing_var) = var {
        debug!("env var {key}: {existing_var}");
    } else {
        debug!("env var {key} requested but not found")
    };

    var
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    get_env_var(key).map(|var| match var.to_lowercase().as_str() {
        "true" => true,
        "false" => false,
        "t" => true,
        "f" => false,
        "1" => true,
        "0" => false,
        str => panic!("invalid bool value {str} for {key}"),
    })
}

pub fn get_env_u64(key: &str) -> Option<u64> {
    get_env_var(key).map(|var| {
        var.trim()
            .parse::<u64>()
            .unwrap_or_else(|_| panic!("invalid unsigned integer value {var} for {key}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_var_safe_some() {
        let test_key = "TEST_KEY_SAFE_SOME";
        let test_value = "my-env-value";
        std::env::set_var(test_key, test_value);
        assert_eq!(get_env_var(test_key), Some(test_value.to_string()));
    }

    #[test]
    fn test_get_env_var_safe_none() {
        let key = get_env_var("DOESNT_EXIST");
        assert!(key.is_none());
    }

    #[test]
    fn test_get_env_bool_not_there() {
        let flag = get_env_bool("DOESNT_EXIST");
        assert_eq!(flag, None);
    }

    #[test]
    fn test_get_env_bool_true_upper() {
        let test_key = "TEST_KEY_BOOL_TRUE2";
        std::env::set_var(test_key, "TRUE");
        assert_eq!(get_env_bool(test_key), Some(true));
    }

    #[test]
    fn test_get_env_bool_false() {
        let test_key = "TEST_KEY_BOOL_FALSE";
        std::env::set_var(test_key, "0");
        assert_eq!(get_env_bool(test_key), Some(false));
    }

    #[test]
    fn test_get_env_u64() {
        let test_key = "TEST_KEY_U64";
        std::env::set_var(test_key, " 42 ");
        assert_eq!(get_env_u64(test_key), Some(42));
    }

    #[test]
    #[should_panic]
    fn test_get_env_u64_invalid_panics() {
        let test_key = "TEST_KEY_U64_INVALID";
        std::env::set_var(test_key, "forty-two");
        get_env_u64(test_key);
    }
}
