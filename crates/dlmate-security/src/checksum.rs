use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

pub fn sha256_reader_hex<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0_u8; 64 * 1024];
    loop {
        let read = reader
            .read(&mut buffer)
            .context("failed reading payload for sha256")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {} for sha256", path.display()))?;
    sha256_reader_hex(BufReader::new(file))
        .with_context(|| format!("failed hashing {}", path.display()))
}

pub fn verify_sha256(payload: &[u8], expected_hex: &str) -> Result<bool> {
    let expected = normalize_expected_hex(expected_hex)?;
    Ok(sha256_hex(payload) == expected)
}

pub fn verify_sha256_file(path: &Path, expected_hex: &str) -> Result<bool> {
    let expected = normalize_expected_hex(expected_hex)?;
    Ok(sha256_file_hex(path)? == expected)
}

fn normalize_expected_hex(expected_hex: &str) -> Result<String> {
    let expected = expected_hex.trim().to_ascii_lowercase();
    let decoded = hex::decode(&expected).context("failed to decode expected sha256 hex")?;
    if decoded.len() != 32 {
        return Err(anyhow!(
            "invalid sha256 length: expected 32 bytes, got {}",
            decoded.len()
        ));
    }
    Ok(expected)
}
