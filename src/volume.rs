//! Persistent volume management.
//!
//! The module provides a tiny helper that reads and writes the last
//! commanded volume to `volume.txt` inside the platform config directory,
//! so a restarted server comes back at the level the user left it.

use std::{num::ParseIntError, path::PathBuf};
use tokio::fs;

/// Shorthand for a [`Result`] with a persistent volume error.
type Result<T> = std::result::Result<T, Error>;

/// The volume used when nothing was persisted yet.
const DEFAULT: u8 = 75;

/// Errors which occur when loading/saving the persistent volume.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("couldn't find config directory")]
    Directory,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error parsing volume integer: {0}")]
    Parse(#[from] ParseIntError),

    #[error("volume out of range: {0}")]
    Range(u16),
}

/// Representation of the persistent volume stored on disk.
///
/// The inner value is an integer percentage (0..=100), which is also the
/// unit the engine and the sink drivers speak.
#[derive(Debug, Clone, Copy)]
pub struct PersistentVolume {
    /// The volume, as a percentage.
    inner: u8,
}

impl PersistentVolume {
    /// Retrieves the config directory, creating it if necessary.
    async fn config() -> Result<PathBuf> {
        let config = dirs::config_dir()
            .ok_or(Error::Directory)?
            .join(PathBuf::from("roomtone"));

        if !config.exists() {
            fs::create_dir_all(&config).await?;
        }

        Ok(config)
    }

    /// The volume as an integer percent.
    pub const fn get(self) -> u8 {
        self.inner
    }

    /// Parses the stored form, tolerating whitespace and a `%` suffix.
    fn parse(contents: &str) -> Result<u8> {
        let trimmed = contents.trim();
        let stripped = trimmed.strip_suffix('%').unwrap_or(trimmed);
        let value: u16 = stripped.parse()?;

        if value > 100 {
            return Err(Error::Range(value));
        }

        Ok(value as u8)
    }

    /// Loads the [`PersistentVolume`] from the platform config directory.
    ///
    /// If the file does not exist, the default is written and returned.
    pub async fn load() -> Result<Self> {
        let config = Self::config().await?;
        let path = config.join(PathBuf::from("volume.txt"));

        let volume = if path.exists() {
            let contents = fs::read_to_string(path).await?;
            Self::parse(&contents)?
        } else {
            fs::write(&path, DEFAULT.to_string()).await?;
            DEFAULT
        };

        Ok(Self { inner: volume })
    }

    /// Saves `volume` (an integer percent) to `volume.txt`.
    pub async fn save(volume: u8) -> Result<()> {
        let config = Self::config().await?;
        let path = config.join(PathBuf::from("volume.txt"));
        fs::write(path, volume.to_string()).await?;

        Ok(())
    }
}

impl Default for PersistentVolume {
    fn default() -> Self {
        Self { inner: DEFAULT }
    }
}

#[cfg(test)]
mod tests {
    use super::PersistentVolume;

    #[test]
    fn parse_plain_integer() {
        assert_eq!(PersistentVolume::parse("75").unwrap(), 75);
    }

    #[test]
    fn parse_tolerates_suffix_and_whitespace() {
        assert_eq!(PersistentVolume::parse(" 40%\n").unwrap(), 40);
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert!(PersistentVolume::parse("150").is_err());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(PersistentVolume::parse("loud").is_err());
    }
}
