use std::{
    fs, io,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

/// Uppercase hex SHA-256 of a file's contents.
pub fn file_hash(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode_upper(Sha256::digest(&bytes)))
}

/// `<install_path>/<script file name>.hash`
pub fn hash_record_path(install_path: &Path, script: &Path) -> PathBuf {
    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    install_path.join(format!("{name}.hash"))
}

/// True only when both files exist and the stored hash equals the current
/// content hash exactly (case and whitespace sensitive).
pub fn matches(file: &Path, hash_file: &Path) -> bool {
    if !file.exists() || !hash_file.exists() {
        return false;
    }
    let (Ok(current), Ok(stored)) = (file_hash(file), fs::read_to_string(hash_file)) else {
        return false;
    };
    current == stored
}
