//! Package delivery.
//!
//! Software packages are gzip'd tarballs carrying a `package.toml`
//! manifest; firmware images are opaque and only checked against the size
//! announced at download time.

use crate::state::{PackageIdent, UpdateResult};
use failure::Fail;
use flate2::read::GzDecoder;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Manifest file name, at the archive root.
pub(crate) const MANIFEST: &str = "package.toml";

#[derive(Debug, Fail)]
pub(crate) enum DeliveryError {
    #[fail(display = "package integrity check failed: {}", _0)]
    Integrity(String),
    #[fail(display = "unsupported package: {}", _0)]
    Unsupported(String),
}

impl DeliveryError {
    pub(crate) fn result_code(&self) -> UpdateResult {
        match self {
            DeliveryError::Integrity(_) => UpdateResult::IntegrityCheckFailure,
            DeliveryError::Unsupported(_) => UpdateResult::UnsupportedPackage,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    version: String,
}

/// Unpack a software package into `dest`, replacing anything there.
///
/// Nothing is left behind in `dest` on failure.
pub(crate) fn unpack_software(package: &Path, dest: &Path) -> Result<PackageIdent, DeliveryError> {
    remove_tree(dest)?;
    fs::create_dir_all(dest).map_err(|e| DeliveryError::Integrity(e.to_string()))?;

    let unpacked = extract(package, dest).and_then(|_| read_manifest(dest));
    if unpacked.is_err() {
        if let Err(e) = remove_tree(dest) {
            warn!("failed to clean up {}: {}", dest.display(), e);
        }
    }
    let ident = unpacked?;
    info!("software package {} unpacked to {}", ident, dest.display());
    Ok(ident)
}

fn extract(package: &Path, dest: &Path) -> Result<(), DeliveryError> {
    let file = fs::File::open(package).map_err(|e| DeliveryError::Integrity(e.to_string()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| DeliveryError::Integrity(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| DeliveryError::Integrity(e.to_string()))?;
        let path = {
            let raw = entry.path_bytes();
            String::from_utf8_lossy(&raw).into_owned()
        };
        if !is_safe_path(&path) {
            return Err(DeliveryError::Unsupported(format!(
                "unsafe path '{}' in archive",
                path
            )));
        }

        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            return Err(DeliveryError::Unsupported(format!(
                "entry '{}' is neither a file nor a directory",
                path
            )));
        }
        trace!("unpacking {}", path);
        let inside = entry
            .unpack_in(dest)
            .map_err(|e| DeliveryError::Integrity(format!("{}: {}", path, e)))?;
        if !inside {
            return Err(DeliveryError::Unsupported(format!(
                "entry '{}' escapes the package root",
                path
            )));
        }
    }
    Ok(())
}

fn read_manifest(dest: &Path) -> Result<PackageIdent, DeliveryError> {
    let content = match fs::read_to_string(dest.join(MANIFEST)) {
        Ok(c) => c,
        Err(ref e) if e.kind() == ErrorKind::NotFound => {
            return Err(DeliveryError::Unsupported(format!("missing {}", MANIFEST)))
        }
        Err(e) => return Err(DeliveryError::Integrity(e.to_string())),
    };
    let manifest: Manifest = toml::from_str(&content)
        .map_err(|e| DeliveryError::Unsupported(format!("bad {}: {}", MANIFEST, e)))?;
    let version = semver::Version::parse(&manifest.version).map_err(|e| {
        DeliveryError::Unsupported(format!("bad version '{}': {}", manifest.version, e))
    })?;
    if manifest.name.is_empty() {
        return Err(DeliveryError::Unsupported("empty package name".to_string()));
    }
    Ok(PackageIdent {
        name: manifest.name,
        version,
    })
}

fn is_safe_path(path: &str) -> bool {
    if path.starts_with('/') || path.contains('\0') {
        return false;
    }
    !path.split('/').any(|part| part == "..")
}

fn remove_tree(dir: &Path) -> Result<(), DeliveryError> {
    match fs::remove_dir_all(dir) {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DeliveryError::Integrity(e.to_string())),
    }
}

/// Check a downloaded firmware image, returning its size.
///
/// `expected_size` is the size announced by the server, 0 if unknown.
pub(crate) fn verify_firmware(package: &Path, expected_size: u64) -> Result<u64, DeliveryError> {
    let meta = fs::metadata(package).map_err(|e| DeliveryError::Integrity(e.to_string()))?;
    let size = meta.len();
    if size == 0 {
        return Err(DeliveryError::Unsupported("empty firmware image".to_string()));
    }
    if expected_size != 0 && size != expected_size {
        return Err(DeliveryError::Integrity(format!(
            "firmware image holds {} bytes, {} announced",
            size, expected_size
        )));
    }
    debug!("firmware image verified, {} bytes", size);
    Ok(size)
}
