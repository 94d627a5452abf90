use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const ENV_WORKSPACE: &str = "TILEDB_WORKSPACE";
pub const ENV_CONFIG: &str = "TILEDB_CONFIG";

const DEFAULT_SEGMENT_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_WRITE_STATE_MAX_SIZE: u64 = 256 * 1024 * 1024;

/// Engine tunables, keyed by the `sm.*` namespace of the config file.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Minimum amount of data exchanged between the disk and main memory
    /// in a single I/O operation.
    pub segment_size: u64,
    /// Byte budget of the process-wide decoded-tile cache; 0 disables it.
    pub tile_cache_size: u64,
    /// Maximum size of the in-memory cell run of a single write.
    pub write_state_max_size: u64,
    /// Threads in the compute pool (tile preparation, filtering, sorting).
    pub compute_concurrency_level: usize,
    /// Threads in the I/O pool (disk reads and writes).
    pub io_concurrency_level: usize,
    /// Consolidation window, recognized but unused by the core.
    pub consolidation_timestamp_start: u64,
    pub consolidation_timestamp_end: u64,
}

impl Default for Config {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Config {
            segment_size: DEFAULT_SEGMENT_SIZE,
            tile_cache_size: 0,
            write_state_max_size: DEFAULT_WRITE_STATE_MAX_SIZE,
            compute_concurrency_level: parallelism,
            io_concurrency_level: parallelism,
            consolidation_timestamp_start: 0,
            consolidation_timestamp_end: u64::MAX,
        }
    }
}

impl Config {
    /// Loads configuration from the `TILEDB_CONFIG` file if the variable
    /// is set, falling back to defaults otherwise.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(ENV_CONFIG) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Parses a key/value config file: one `key value` or `key=value` pair
    /// per line, `#` comments.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::io(path, e))?;
        Self::from_kv_pairs(parse_kv(&contents)?)
    }

    fn from_kv_pairs(pairs: HashMap<String, String>) -> Result<Self> {
        let mut config = Config::default();
        for (key, value) in pairs {
            let parse_u64 = || -> Result<u64> {
                value.parse::<u64>().map_err(|_| {
                    Error::SchemaInvalid(format!(
                        "config key '{key}': invalid value '{value}'"
                    ))
                })
            };
            match key.as_str() {
                "sm.segment_size" => config.segment_size = parse_u64()?,
                "sm.tile_cache_size" => config.tile_cache_size = parse_u64()?,
                "sm.write_state_max_size" => {
                    config.write_state_max_size = parse_u64()?
                }
                "sm.compute_concurrency_level" => {
                    config.compute_concurrency_level = parse_u64()? as usize
                }
                "sm.io_concurrency_level" => {
                    config.io_concurrency_level = parse_u64()? as usize
                }
                "sm.consolidation.timestamp_start" => {
                    config.consolidation_timestamp_start = parse_u64()?
                }
                "sm.consolidation.timestamp_end" => {
                    config.consolidation_timestamp_end = parse_u64()?
                }
                // Unrecognized keys are ignored so that configs can be
                // shared with newer engine versions.
                _ => {}
            }
        }
        if config.segment_size == 0 {
            return Err(Error::SchemaInvalid(
                "sm.segment_size must be positive".to_owned(),
            ));
        }
        if config.write_state_max_size < config.segment_size {
            return Err(Error::SchemaInvalid(
                "sm.write_state_max_size must be at least sm.segment_size"
                    .to_owned(),
            ));
        }
        Ok(config)
    }

    /// Resolves the workspace directory: the explicit argument if given,
    /// else the `TILEDB_WORKSPACE` environment variable.
    pub fn resolve_workspace(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_owned());
        }
        match std::env::var_os(ENV_WORKSPACE) {
            Some(path) => Ok(PathBuf::from(path)),
            None => Err(Error::NotFound(format!(
                "no workspace given and {ENV_WORKSPACE} is unset"
            ))),
        }
    }
}

fn parse_kv(contents: &str) -> Result<HashMap<String, String>> {
    let mut pairs = HashMap::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .or_else(|| line.split_once(char::is_whitespace))
            .ok_or_else(|| {
                Error::SchemaInvalid(format!(
                    "config line {}: expected 'key value'",
                    lineno + 1
                ))
            })?;
        pairs.insert(key.trim().to_owned(), value.trim().to_owned());
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(10 * 1024 * 1024, config.segment_size);
        assert_eq!(0, config.tile_cache_size);
        assert_eq!(256 * 1024 * 1024, config.write_state_max_size);
    }

    #[test]
    fn from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# test config").unwrap();
        writeln!(f, "sm.segment_size 65536").unwrap();
        writeln!(f, "sm.tile_cache_size=1048576").unwrap();
        writeln!(f, "sm.unknown_key whatever").unwrap();
        f.flush().unwrap();

        let config = Config::from_file(f.path()).unwrap();
        assert_eq!(65536, config.segment_size);
        assert_eq!(1048576, config.tile_cache_size);
    }

    #[test]
    fn rejects_zero_segment_size() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "sm.segment_size 0").unwrap();
        f.flush().unwrap();

        assert!(Config::from_file(f.path()).is_err());
    }

    #[test]
    fn rejects_bad_value() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "sm.segment_size lots").unwrap();
        f.flush().unwrap();

        assert!(Config::from_file(f.path()).is_err());
    }
}
