//! Host platform utility functions

use std::{env, path::PathBuf};

/// Environment variable pointing at the root of the software tree, which holds the `params` and
/// `sessions` directories.
pub const SW_ROOT_ENV: &str = "YARN_GUARDIAN_ROOT";

/// Get the software root directory.
pub fn get_sw_root() -> Result<PathBuf, env::VarError> {
    env::var(SW_ROOT_ENV).map(PathBuf::from)
}
