//! Short-lived key files for connectors that only accept a path
//!
//! A [`TemporaryKeyFile`] is written with owner-only permissions and deleted
//! when it is dropped, so every exit path of client construction removes it.

use crate::error::{Error, Result};
use crate::key_format::NormalizedKey;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

const FILE_PREFIX: &str = "medbill-key-";
const FILE_SUFFIX: &str = ".pem";

/// A PEM key written to disk for the lifetime of this value
pub struct TemporaryKeyFile {
    path: TempPath,
}

impl TemporaryKeyFile {
    /// Write `key` to a new file in `dir`, or the system temp dir when `None`
    pub fn write(key: &NormalizedKey, dir: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(FILE_PREFIX).suffix(FILE_SUFFIX);

        let created = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };
        let mut file = created
            .map_err(|e| Error::KeyFile(format!("Failed to create key file: {}", e)))?;

        file.write_all(key.as_str().as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| Error::KeyFile(format!("Failed to write key file: {}", e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| Error::KeyFile(format!("Failed to restrict key file: {}", e)))?;
        }

        let path = file.into_temp_path();
        debug!("Wrote temporary key file {}", path.display());
        Ok(Self { path })
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Owned copy of the location
    pub fn to_path_buf(&self) -> PathBuf {
        self.path.to_path_buf()
    }

    /// Delete the file now and report failure
    ///
    /// Dropping also deletes the file but ignores errors.
    pub fn remove(self) -> Result<()> {
        let shown = self.path.display().to_string();
        self.path
            .close()
            .map_err(|e| Error::KeyFile(format!("Failed to remove {}: {}", shown, e)))?;
        debug!("Removed temporary key file {}", shown);
        Ok(())
    }
}

impl fmt::Debug for TemporaryKeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryKeyFile")
            .field("path", &self.path.display().to_string())
            .finish()
    }
}
