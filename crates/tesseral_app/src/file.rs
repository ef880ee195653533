use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Returns the path if it is absolute, otherwise transforms it into an
/// absolute path by appending it to the current working directory.
pub fn abs_or_relative(path: &Path) -> std::io::Result<PathBuf> {
    abs_or_relative_to(&std::env::current_dir()?, path)
}

pub fn abs_or_relative_to(dir: &Path, path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    Ok(dir.join(path))
}

/// Deserializes data from a TOML file.
pub fn import_toml<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let string = std::fs::read_to_string(path)?;
    toml::from_str(&string).map_err(std::io::Error::other)
}

/// Serializes data to a TOML file.
pub fn export_toml<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let string = toml::to_string_pretty(value).map_err(std::io::Error::other)?;
    std::fs::write(path, string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_anchored() {
        let anchored = abs_or_relative_to(Path::new("/data"), Path::new("run/input.toml")).unwrap();
        assert_eq!(anchored, PathBuf::from("/data/run/input.toml"));

        let absolute = abs_or_relative_to(Path::new("/data"), Path::new("/etc/input.toml")).unwrap();
        assert_eq!(absolute, PathBuf::from("/etc/input.toml"));
    }
}
