// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, unknown_error};
use log::debug;

/// The plain-text status file read by roof controllers. It holds a single
/// line and is overwritten on every cycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        StatusFile{path: path.as_ref().to_path_buf()}
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, status: &str) -> Result<(), CanonicalError> {
        // Write to a sibling file and rename, so readers never see a
        // truncated status.
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);
        fs::write(&tmp_path, format!("{}\n", status))
            .and_then(|()| fs::rename(&tmp_path, &self.path))
            .map_err(|e| unknown_error(
                format!("Error writing status file {:?}: {:?}", self.path, e).as_str()))?;
        debug!("Wrote status {:?} to {:?}", status, self.path);
        Ok(())
    }
}

// mod tests.
