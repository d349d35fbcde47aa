use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    ssi::{MAX_FILES, MAX_KEYS},
};

/// Knobs for an index build. Every field has a default, so a config file
/// only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Once the estimated index size would exceed this many bytes, keys are
    /// spilled to disk and sorted externally.
    pub max_ram_bytes: u64,
    /// Replace an existing index (and stale spill files) instead of failing.
    pub allow_overwrite: bool,
    pub max_files: u16,
    pub max_keys: u64,
    pub max_key_len: usize,
    pub max_filename_len: usize,
    /// Store 8-byte offsets even when every value fits in 4.
    pub force_wide_offsets: bool,
    /// Memory budget for one sorted run of the in-process sorter.
    pub sort_run_bytes: usize,
    /// Run this program (a POSIX `sort`) instead of sorting in-process.
    pub sort_program: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            max_ram_bytes: 256 * 1024 * 1024,
            allow_overwrite: false,
            max_files: MAX_FILES,
            max_keys: MAX_KEYS,
            max_key_len: 1024,
            max_filename_len: 4096,
            force_wide_offsets: false,
            sort_run_bytes: 64 * 1024 * 1024,
            sort_program: None,
        }
    }
}

impl BuildConfig {
    /// Loads a JSON config. A missing file yields the defaults.
    pub fn load<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        match fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_json(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: BuildConfig = serde_json::from_str(contents)
            .map_err(|e| Error::InvalidArgument(format!("bad build config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Limits may be lowered below what the format allows, never raised.
    pub fn validate(&self) -> Result<()> {
        if self.max_files > MAX_FILES {
            return Err(Error::InvalidArgument(format!(
                "max_files {} exceeds the format limit {}",
                self.max_files, MAX_FILES
            )));
        }
        if self.max_keys > MAX_KEYS {
            return Err(Error::InvalidArgument(format!(
                "max_keys {} exceeds the format limit {}",
                self.max_keys, MAX_KEYS
            )));
        }
        for len in [self.max_key_len, self.max_filename_len] {
            if len == 0 || len >= u32::MAX as usize {
                return Err(Error::InvalidArgument(format!(
                    "maximum key and filename lengths must be in 1..{}, got {}",
                    u32::MAX,
                    len
                )));
            }
        }
        if self.sort_run_bytes == 0 {
            return Err(Error::InvalidArgument(
                "sort_run_bytes must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::BuildConfig;
    use crate::error::Error;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config =
            BuildConfig::from_json(r#"{ "max_ram_bytes": 1024, "allow_overwrite": true }"#)
                .unwrap();
        assert_eq!(config.max_ram_bytes, 1024);
        assert!(config.allow_overwrite);
        assert_eq!(config.max_key_len, BuildConfig::default().max_key_len);
        assert_eq!(config.sort_program, None);
    }

    #[test]
    fn test_round_trip_through_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ssi.json");

        assert_eq!(BuildConfig::load(&path)?, BuildConfig::default());

        let config = BuildConfig {
            max_keys: 10,
            sort_program: Some("sort".to_owned()),
            ..BuildConfig::default()
        };
        std::fs::write(&path, config.to_json())?;
        assert_eq!(BuildConfig::load(&path)?, config);
        Ok(())
    }

    #[test]
    fn test_limits_cannot_be_raised() {
        let err = BuildConfig::from_json(r#"{ "max_files": 40000 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = BuildConfig::from_json(r#"{ "max_keys": 9999999999 }"#).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
