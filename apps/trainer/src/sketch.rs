//! Drawing-surface adapter backed by an image file that an external editor
//! keeps saving to.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use session_core::SketchSource;
use shared::domain::SketchArtifact;
use tracing::warn;

pub fn read_sketch(path: &Path) -> Result<SketchArtifact> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read sketch '{}'", path.display()))?;
    if bytes.is_empty() {
        bail!("sketch '{}' is empty", path.display());
    }
    Ok(SketchArtifact {
        mime_type: mime_type_for(path).to_string(),
        image_b64: STANDARD.encode(bytes),
    })
}

fn mime_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "image/png",
    }
}

pub struct FileSketchSource {
    path: PathBuf,
}

impl FileSketchSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SketchSource for FileSketchSource {
    fn export_sketch(&self) -> Option<SketchArtifact> {
        if !self.path.exists() {
            return None;
        }
        match read_sketch(&self.path) {
            Ok(sketch) => Some(sketch),
            Err(err) => {
                warn!("sketch surface unreadable: {err:#}");
                None
            }
        }
    }
}
