use std::io::{Cursor, Read};

use tracing::debug;
use zip::ZipArchive;

use crate::error::{Error, Result};

/// A file pulled out of the downloaded archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFile {
    /// Full entry path inside the archive.
    pub entry: String,
    /// Last path segment of `entry`.
    pub name: String,
    pub bytes: Vec<u8>,
}

/// First `.csv` entry of a zip archive, in archive order.
pub fn first_csv(zip_bytes: &[u8]) -> Result<ExtractedFile> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let path = entry.name().to_string();
        if path.starts_with("__MACOSX/") || !path.to_lowercase().ends_with(".csv") {
            continue;
        }

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        debug!(entry = %path, size = bytes.len(), "extracted csv");
        return Ok(ExtractedFile {
            entry: path,
            name,
            bytes,
        });
    }

    Err(Error::Validation(format!(
        "archive with {} entries contains no .csv file",
        archive.len()
    )))
}

#[cfg(test)]
pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, data) in entries {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
