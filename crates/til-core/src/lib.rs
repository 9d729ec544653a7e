use std::fs;
use std::io;
use std::path::Path;

use anyhow::Result;
use sha2::{Digest, Sha256};

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "til_core_{}_test_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ))
    }

    #[test]
    fn sha256_bytes_matches_known_vector() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn sha256_file_matches_bytes_digest() {
        let root = temp_root("digest");
        ensure_dir(&root).expect("create temp root");
        let path = root.join("payload.bin");
        fs::write(&path, b"0.5: (load truck1 box1) [1.0] ; (1)\n").expect("write payload");

        let from_file = sha256_file(&path).expect("digest file");
        let from_bytes = sha256_bytes(b"0.5: (load truck1 box1) [1.0] ; (1)\n");
        assert_eq!(from_file, from_bytes);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn ensure_dir_is_idempotent() {
        let root = temp_root("ensure");
        let nested = root.join("a").join("b");
        ensure_dir(&nested).expect("first create");
        ensure_dir(&nested).expect("second create");
        assert!(nested.is_dir());

        let _ = fs::remove_dir_all(&root);
    }
}
