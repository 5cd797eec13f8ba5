use std::{env, path::PathBuf};

use crate::config::DEFAULT_MONOOPS_HOME;

use super::MONOOPS_HOME_ENV_VAR;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the monoops home directory, honouring `MONOOPS_HOME` when set.
pub fn get_monoops_home_path() -> PathBuf {
    match env::var(MONOOPS_HOME_ENV_VAR) {
        Ok(home) if !home.trim().is_empty() => PathBuf::from(home),
        _ => DEFAULT_MONOOPS_HOME.clone(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_home_path_honours_env_var() {
        let previous = env::var(MONOOPS_HOME_ENV_VAR).ok();

        env::set_var(MONOOPS_HOME_ENV_VAR, "/tmp/monoops-home");
        assert_eq!(get_monoops_home_path(), PathBuf::from("/tmp/monoops-home"));

        env::set_var(MONOOPS_HOME_ENV_VAR, "  ");
        assert_eq!(get_monoops_home_path(), *DEFAULT_MONOOPS_HOME);

        match previous {
            Some(value) => env::set_var(MONOOPS_HOME_ENV_VAR, value),
            None => env::remove_var(MONOOPS_HOME_ENV_VAR),
        }
    }
}
