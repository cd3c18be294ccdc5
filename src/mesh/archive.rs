//! Bundling of rendered artifacts into a zip archive

use std::io::{Cursor, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::mesh::render::MeshBundle;

/// Serializes the bundle into an in-memory zip archive.
pub fn build_zip(bundle: &MeshBundle) -> std::io::Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in &bundle.files {
        writer
            .start_file(file.path.as_str(), options)
            .map_err(std::io::Error::other)?;
        writer.write_all(file.contents.as_bytes())?;
    }

    let cursor = writer.finish().map_err(std::io::Error::other)?;
    Ok(cursor.into_inner())
}

/// Writes the bundle as plain files under `dir` (offline `generate` path).
pub fn write_bundle_to_dir(bundle: &MeshBundle, dir: &Path) -> std::io::Result<()> {
    for file in &bundle.files {
        let path = dir.join(&file.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, &file.contents)?;
    }
    Ok(())
}
