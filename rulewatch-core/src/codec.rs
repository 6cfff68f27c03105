//! Record persistence for rule files, directory caches and pending jobs.
//!
//! Records are JSON documents. Writes go through a sibling temp file that is
//! renamed into place, so readers never observe a half-written record.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::{EngineError, Result};

pub fn load_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).map_err(|err| EngineError::io(path, err))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn save_record<T: Serialize>(record: &T, path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::Internal(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|err| EngineError::io(parent, err))?;

    let tmp = NamedTempFile::new_in(parent).map_err(|err| EngineError::io(parent, err))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, record)?;
        writer.flush().map_err(|err| EngineError::io(path, err))?;
    }
    tmp.persist(path)
        .map_err(|err| EngineError::io(path, err.error))?;
    Ok(())
}
