//! Filesystem locations used by chime.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data (alarm db, logs) | `~/Library/Application Support/chime/` | `~/.local/share/chime/` |
//! | Config | `~/Library/Application Support/chime/` | `~/.config/chime/` |
//!
//! Overrides:
//! - `CHIME_DATA_DIR` replaces [`data_dir`]
//! - `CHIME_CONFIG_DIR` replaces [`config_dir`]

use std::path::PathBuf;

/// Persistent data root.
///
/// Resolves to `dirs::data_dir()/chime/` unless `CHIME_DATA_DIR` is set.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CHIME_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("chime"))
        .unwrap_or_else(|| PathBuf::from("/tmp/chime-data"))
}

/// Configuration directory.
///
/// Resolves to `dirs::config_dir()/chime/` unless `CHIME_CONFIG_DIR` is set.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("CHIME_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("chime"))
        .unwrap_or_else(|| PathBuf::from("/tmp/chime-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// `config_dir()/config.toml`
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default alarm database (`data_dir()/alarms.db`).
#[must_use]
pub fn alarm_db_file() -> PathBuf {
    data_dir().join(crate::alarm::store::DB_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_contains_chime() {
        let dir = data_dir();
        assert!(!dir.as_os_str().is_empty());
        if std::env::var_os("CHIME_DATA_DIR").is_none() {
            assert!(dir.to_string_lossy().contains("chime"));
        }
    }

    #[test]
    fn derived_paths_hang_off_their_roots() {
        assert!(logs_dir().starts_with(data_dir()));
        assert!(alarm_db_file().starts_with(data_dir()));
        assert!(alarm_db_file().ends_with("alarms.db"));
        assert!(config_file().ends_with("config.toml"));
    }

    #[test]
    fn dir_overrides_via_env() {
        for (key, resolve) in [
            ("CHIME_DATA_DIR", data_dir as fn() -> PathBuf),
            ("CHIME_CONFIG_DIR", config_dir as fn() -> PathBuf),
        ] {
            let original = std::env::var_os(key);

            unsafe { std::env::set_var(key, "/custom/chime") };
            assert_eq!(resolve(), PathBuf::from("/custom/chime"));

            match original {
                Some(val) => unsafe { std::env::set_var(key, val) },
                None => unsafe { std::env::remove_var(key) },
            }
        }
    }
}
