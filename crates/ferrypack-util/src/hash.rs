use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Hex-encoded BLAKE3 digest of a byte slice.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Hex-encoded BLAKE3 digest over several parts.
///
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` hash
/// differently.
#[must_use]
pub fn blake3_parts(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hasher.finalize().to_hex().to_string()
}

/// Hex-encoded BLAKE3 digest of a file, streamed in 8 KiB chunks.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn blake3_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
