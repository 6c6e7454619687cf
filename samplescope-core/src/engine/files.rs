//! Virtual file namespace backing `registerFileBuffer`-style registration.
//!
//! Registered buffers are written into a private scratch directory that the
//! engine searches for relative paths (`file_search_path`), so SQL can refer
//! to them by their logical name alone. The directory is removed when the
//! registry is dropped.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parquet::file::reader::{FileReader, SerializedFileReader};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::EngineError;

pub struct FileRegistry {
    root: TempDir,
    files: BTreeSet<String>,
}

impl FileRegistry {
    pub fn new() -> Result<Self, EngineError> {
        let root = tempfile::Builder::new()
            .prefix("samplescope-files-")
            .tempdir()?;
        debug!(root = %root.path().display(), "created virtual file namespace");
        Ok(Self {
            root,
            files: BTreeSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Store `buffer` under `name`, replacing any previous buffer with that name.
    pub fn register(&mut self, name: &str, buffer: Bytes) -> Result<PathBuf, EngineError> {
        validate_name(name)?;
        if is_parquet_name(name) {
            validate_parquet(name, &buffer)?;
        }

        let path = self.root.path().join(name);
        fs::write(&path, &buffer).map_err(|err| EngineError::RegistrationFailed {
            name: name.to_string(),
            reason: format!("failed to write buffer: {err}"),
        })?;
        self.files.insert(name.to_string());
        info!(name, bytes = buffer.len(), "registered file buffer");
        Ok(path)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains(name)
    }
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::RegistrationFailed {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.trim().is_empty() {
        return Err(invalid("logical file name is empty"));
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(invalid("logical file name must not contain path components"));
    }
    if name.contains('\0') {
        return Err(invalid("logical file name contains null bytes"));
    }
    Ok(())
}

fn is_parquet_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".parquet")
}

fn validate_parquet(name: &str, buffer: &Bytes) -> Result<(), EngineError> {
    let reader =
        SerializedFileReader::new(buffer.clone()).map_err(|err| EngineError::RegistrationFailed {
            name: name.to_string(),
            reason: format!("not a readable parquet file: {err}"),
        })?;
    let metadata = reader.metadata().file_metadata();
    debug!(
        name,
        rows = metadata.num_rows(),
        columns = metadata.schema_descr().num_columns(),
        "validated parquet footer"
    );
    Ok(())
}
