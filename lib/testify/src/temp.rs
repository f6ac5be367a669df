use std::path::PathBuf;

use rand::Rng;
use rand::distr::Alphanumeric;

/// A path under the system temp dir which does not exist yet.
pub fn temp_file() -> PathBuf {
    let name = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect::<String>();

    std::env::temp_dir().join(format!("puppetdb-sd-{name}"))
}

/// Create an empty directory under the system temp dir, callers are
/// responsible for removing it.
pub fn temp_dir() -> PathBuf {
    let path = temp_file();
    std::fs::create_dir_all(&path).unwrap_or_else(|err| panic!("create {path:?} failed, {err}"));
    path
}
