//! Per-request diagnostic dump: writes intermediate artifacts to disk.
//!
//! Disabled unless `ImagingSettings::dump_dir` is set (`TRICARE_DUMP_DIR`).
//!
//! **Output structure**:
//! ```text
//! {dump_dir}/{request_id}/
//!   00-request.json
//!   01-original.png
//!   02-classification.json
//!   03-heatmap.png
//!   04-fallback.json
//!   05-outcome.json
//!   06-trace.json
//! ```
//!
//! Every writer logs and swallows its own I/O errors: a failed dump never
//! affects the analysis result.

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Dump directory for one request.
#[derive(Debug, Clone)]
pub struct DiagnosticDump {
    dir: PathBuf,
}

impl DiagnosticDump {
    /// `None` when dumping is disabled or the directory cannot be created.
    pub fn open(base: Option<&Path>, request_id: &Uuid) -> Option<Self> {
        let dir = base?.join(request_id.to_string());

        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(
                path = %dir.display(),
                error = %e,
                "Diagnostic dump: failed to create directory"
            );
            return None;
        }

        Some(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a binary artifact (PNG image, raw bytes).
    pub fn binary(&self, filename: &str, data: &[u8]) {
        let path = self.dir.join(filename);
        match std::fs::write(&path, data) {
            Ok(()) => tracing::debug!(
                path = %path.display(),
                size = data.len(),
                "Diagnostic dump: binary written"
            ),
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Diagnostic dump: failed to write binary"
            ),
        }
    }

    /// Write a pretty-printed JSON artifact.
    pub fn json<T: serde::Serialize>(&self, filename: &str, value: &T) {
        let path = self.dir.join(filename);
        match serde_json::to_string_pretty(value) {
            Ok(json) => match std::fs::write(&path, json.as_bytes()) {
                Ok(()) => tracing::debug!(
                    path = %path.display(),
                    size = json.len(),
                    "Diagnostic dump: JSON written"
                ),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Diagnostic dump: failed to write JSON"
                ),
            },
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Diagnostic dump: failed to serialize JSON"
            ),
        }
    }

    /// Encode an RGB raster as PNG and write it.
    pub fn png(&self, filename: &str, image: &image::RgbImage) {
        let mut cursor = std::io::Cursor::new(Vec::new());
        match image.write_to(&mut cursor, image::ImageFormat::Png) {
            Ok(()) => self.binary(filename, &cursor.into_inner()),
            Err(e) => tracing::warn!(
                file = filename,
                error = %e,
                "Diagnostic dump: failed to encode PNG"
            ),
        }
    }
}
