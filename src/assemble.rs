//! Payload assembly.
//!
//! Splits the verified, concatenated byte sequence into the declared file
//! layout and writes it out. The order of `files` in the metainfo is
//! authoritative: it determines the byte-offset mapping and is never
//! reordered. Path components from the metainfo are untrusted and are
//! validated against directory traversal before any write.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::metainfo::Info;

/// Write an assembled payload under `dest_dir`.
///
/// Single-file torrents produce one file named after `info.name`.
/// Multi-file torrents produce `name/<path components>` for each declared
/// entry, slicing the payload by each entry's length in declared order.
pub async fn write_payload(info: &Info, payload: &[u8], dest_dir: &Path) -> Result<()> {
    if payload.len() as u64 != info.total_length {
        return Err(Error::metainfo(format!(
            "payload is {} bytes, metainfo declares {}",
            payload.len(),
            info.total_length
        )));
    }

    if info.is_single_file() {
        let path = dest_dir.join(validated_component(&info.name)?);
        tokio::fs::write(&path, payload).await?;
        tracing::info!(path = %path.display(), bytes = payload.len(), "wrote file");
        return Ok(());
    }

    let base = dest_dir.join(validated_component(&info.name)?);
    tokio::fs::create_dir_all(&base).await?;

    let mut offset = 0usize;
    for entry in info.file_layout() {
        let mut path = base.clone();
        for component in &entry.path {
            path.push(validated_component(component)?);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let end = offset + entry.length as usize;
        tokio::fs::write(&path, &payload[offset..end]).await?;
        tracing::info!(path = %path.display(), bytes = entry.length, "wrote file");
        offset = end;
    }

    Ok(())
}

/// Accept a single path component from the metainfo, rejecting traversal
/// and absolute-path tricks.
fn validated_component(component: &str) -> Result<PathBuf> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(Error::metainfo(format!(
            "invalid path component {component:?} in file layout"
        )));
    }
    if component.contains('/') || component.contains('\\') || component.contains('\0') {
        return Err(Error::metainfo(format!(
            "path component {component:?} contains a separator"
        )));
    }
    Ok(PathBuf::from(component))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;

    fn single_file_info(total: u64) -> Info {
        Info {
            name: "file.bin".to_string(),
            piece_length: 16384,
            pieces: vec![[0u8; 20]; total.div_ceil(16384) as usize],
            files: vec![FileEntry {
                length: total,
                path: vec!["file.bin".to_string()],
            }],
            total_length: total,
            single_file: true,
        }
    }

    fn multi_file_info() -> Info {
        Info {
            name: "pack".to_string(),
            piece_length: 16384,
            pieces: vec![[0u8; 20]],
            files: vec![
                FileEntry {
                    length: 6,
                    path: vec!["docs".to_string(), "a.txt".to_string()],
                },
                FileEntry {
                    length: 4,
                    path: vec!["b.bin".to_string()],
                },
            ],
            total_length: 10,
            single_file: false,
        }
    }

    #[tokio::test]
    async fn writes_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![0x5au8; 100];
        let info = single_file_info(100);

        write_payload(&info, &payload, dir.path()).await.unwrap();

        let written = tokio::fs::read(dir.path().join("file.bin")).await.unwrap();
        assert_eq!(written, payload);
    }

    #[tokio::test]
    async fn splits_multi_file_in_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        let payload = b"aaaaaabbbb".to_vec();
        let info = multi_file_info();

        write_payload(&info, &payload, dir.path()).await.unwrap();

        let a = tokio::fs::read(dir.path().join("pack/docs/a.txt")).await.unwrap();
        let b = tokio::fs::read(dir.path().join("pack/b.bin")).await.unwrap();
        assert_eq!(a, b"aaaaaa");
        assert_eq!(b, b"bbbb");
    }

    #[tokio::test]
    async fn rejects_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let info = single_file_info(100);
        assert!(write_payload(&info, &[0u8; 99], dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn rejects_traversal_components() {
        let dir = tempfile::tempdir().unwrap();
        let mut info = multi_file_info();
        info.files[0].path = vec!["..".to_string(), "escape.txt".to_string()];

        let err = write_payload(&info, &[0u8; 10], dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid path component"));
    }

    #[test]
    fn component_validation() {
        assert!(validated_component("normal.txt").is_ok());
        assert!(validated_component("with space").is_ok());
        assert!(validated_component("").is_err());
        assert!(validated_component(".").is_err());
        assert!(validated_component("..").is_err());
        assert!(validated_component("a/b").is_err());
        assert!(validated_component("a\\b").is_err());
    }
}
