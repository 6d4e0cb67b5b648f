use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum UnpackError {
    #[error("no resource archive for module at {0}")]
    MissingArchive(PathBuf),

    #[error("unreadable archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts `<assets>/<module>_resources.zip` into `<files>/modules/<module>/`.
pub struct ResourceUnpacker {
    assets_dir: PathBuf,
    files_dir: PathBuf,
}

impl ResourceUnpacker {
    pub fn new(assets_dir: PathBuf, files_dir: PathBuf) -> Self {
        Self { assets_dir, files_dir }
    }

    pub fn archive_path(&self, module: &str) -> PathBuf {
        self.assets_dir.join(format!("{}_resources.zip", module))
    }

    pub fn target_dir(&self, module: &str) -> PathBuf {
        self.files_dir.join("modules").join(module)
    }

    /// Returns the number of files written.
    pub fn unpack(&self, module: &str) -> Result<usize, UnpackError> {
        let dest = self.target_dir(module);
        fs::create_dir_all(&dest)?;

        let archive_path = self.archive_path(module);
        if !archive_path.is_file() {
            return Err(UnpackError::MissingArchive(archive_path));
        }
        extract_zip(&archive_path, &dest)
    }

    /// Unpacks on a blocking worker. Failures are logged and dropped; a module
    /// works without its bundled resources.
    pub fn unpack_in_background(self: &Arc<Self>, module: &str) {
        let this = self.clone();
        let module = module.to_string();
        tokio::task::spawn_blocking(move || match this.unpack(&module) {
            Ok(n) => tracing::info!("[UNPACK] {}: extracted {} files", module, n),
            Err(e) => tracing::warn!("[UNPACK] {}: {}", module, e),
        });
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize, UnpackError> {
    let mut archive = zip::ZipArchive::new(File::open(archive_path)?)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        // entries escaping the target directory are skipped
        let outpath = match entry.enclosed_name() {
            Some(p) => dest.join(p),
            None => continue,
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
            continue;
        }
        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&outpath)?;
        std::io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
pub(crate) fn write_archive(path: &Path, entries: &[(&str, &str)]) {
    use std::io::Write;

    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, body) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}
