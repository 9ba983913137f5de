//! Uploaded program images.
//!
//! An image is validated before it is written anywhere, then stored as a
//! temporary file that is removed when the owning [`UploadedImage`] drops.
//! Sessions and full runs hold the image for exactly as long as the process
//! may read it.

use std::path::Path;

use tempfile::{Builder, NamedTempFile};

use crate::error::SimError;

/// Simulator memory size; larger images cannot be loaded.
pub const MAX_IMAGE_BYTES: usize = 65536;

/// Extension the simulator expects for machine code files.
pub const IMAGE_EXTENSION: &str = "bin";

/// A validated program image persisted to disk.
#[derive(Debug)]
pub struct UploadedImage {
    file: NamedTempFile,
    original_name: String,
    len: usize,
}

impl UploadedImage {
    /// Validate `bytes` and write them to a fresh file in `dir`.
    pub fn store(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<Self, SimError> {
        validate(file_name, bytes)?;

        std::fs::create_dir_all(dir)?;
        let mut file = Builder::new()
            .prefix("zx16-image-")
            .suffix(".bin")
            .tempfile_in(dir)?;
        std::io::Write::write_all(&mut file, bytes)?;
        std::io::Write::flush(&mut file)?;

        log::debug!(
            "Stored upload '{}' ({} bytes) at {}",
            file_name,
            bytes.len(),
            file.path().display()
        );

        Ok(Self {
            file,
            original_name: file_name.to_string(),
            len: bytes.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Delete the backing file now instead of waiting for drop.
    pub fn discard(self) {
        let path = self.file.path().to_path_buf();
        if let Err(err) = self.file.close() {
            log::warn!("Failed to delete image {}: {}", path.display(), err);
        }
    }
}

/// Reject uploads the simulator could not load.
pub fn validate(file_name: &str, bytes: &[u8]) -> Result<(), SimError> {
    let name = file_name.trim();
    if name.is_empty() {
        return Err(SimError::Validation("No file selected".to_string()));
    }

    let has_extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(IMAGE_EXTENSION))
        .unwrap_or(false);
    if !has_extension {
        return Err(SimError::Validation(format!(
            "Expected a .{} file, got '{}'",
            IMAGE_EXTENSION, name
        )));
    }

    if bytes.is_empty() {
        return Err(SimError::Validation("Uploaded file is empty".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(SimError::Validation(format!(
            "Image length {} is not a whole number of 16-bit instructions",
            bytes.len()
        )));
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(SimError::Validation(format!(
            "Image is {} bytes, limit is {}",
            bytes.len(),
            MAX_IMAGE_BYTES
        )));
    }

    Ok(())
}
