//! Torrent metainfo parsing (BEP 3).
//!
//! Parses .torrent files into typed form and derives the infohash: the
//! SHA-1 of the canonical bencoding of the `info` dictionary. Piece indexing
//! helpers live here too; the last piece is the short remainder.

use sha1::{Digest, Sha1};

use crate::bencode::Value;
use crate::error::{Error, Result};

/// SHA-1 hash (20 bytes).
pub type Sha1Hash = [u8; 20];

/// A parsed .torrent file.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    /// Primary tracker announce URL.
    pub announce: String,
    /// The parsed info dictionary.
    pub info: Info,
    /// SHA-1 of the canonically bencoded info dictionary.
    pub info_hash: Sha1Hash,
}

/// The info dictionary.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory.
    pub name: String,
    /// Number of bytes per piece.
    pub piece_length: u64,
    /// SHA-1 hash of each plaintext piece, in index order.
    pub pieces: Vec<Sha1Hash>,
    /// Files in declared order. Single-file torrents hold one entry named
    /// after `name`; the declared order determines byte offsets and must
    /// not be reordered.
    pub files: Vec<FileEntry>,
    /// Total size of all files.
    pub total_length: u64,
    /// Whether this is a single-file torrent.
    pub single_file: bool,
}

/// One file of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// File size in bytes.
    pub length: u64,
    /// Relative path components below the torrent name.
    pub path: Vec<String>,
}

impl TorrentFile {
    /// Parse a .torrent file from its raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = Value::decode_exact(data)?;
        if root.as_dict().is_none() {
            return Err(Error::metainfo("root must be a dictionary"));
        }

        let announce = root
            .get("announce")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::metainfo("missing 'announce'"))?
            .to_string();

        let info_value = root
            .get("info")
            .ok_or_else(|| Error::metainfo("missing 'info'"))?;

        let info = Info::from_value(info_value)?;
        let info_hash = hash_info(info_value);

        Ok(Self {
            announce,
            info,
            info_hash,
        })
    }

    /// Build a torrent from parts obtained out of band, e.g. a magnet link
    /// plus metadata fetched from peers.
    pub fn from_parts(announce: String, info: Info, info_hash: Sha1Hash) -> Self {
        Self {
            announce,
            info,
            info_hash,
        }
    }

    /// Infohash rendered as 40 lowercase hex characters.
    pub fn info_hash_hex(&self) -> String {
        hex_string(&self.info_hash)
    }
}

impl Info {
    /// Parse a bare bencoded info dictionary, e.g. metadata received via
    /// ut_metadata.
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::from_value(&Value::decode_exact(data)?)
    }

    /// Build an `Info` from a decoded bencode value.
    pub fn from_value(value: &Value) -> Result<Self> {
        let dict = value
            .as_dict()
            .ok_or_else(|| Error::metainfo("'info' must be a dictionary"))?;

        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::metainfo("missing 'name' in info"))?
            .to_string();

        let piece_length = value
            .get("piece length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| Error::metainfo("missing or invalid 'piece length'"))?;
        if piece_length == 0 {
            return Err(Error::metainfo("'piece length' must be greater than zero"));
        }

        let pieces_bytes = value
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| Error::metainfo("missing 'pieces'"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(Error::metainfo(format!(
                "'pieces' length {} is not a multiple of 20",
                pieces_bytes.len()
            )));
        }
        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, total_length, single_file) = if dict.contains_key(b"files".as_slice()) {
            let (files, total) = parse_files(value.get("files").unwrap())?;
            (files, total, false)
        } else {
            let length = value
                .get("length")
                .and_then(|v| v.as_uint())
                .ok_or_else(|| Error::metainfo("missing 'length' for single-file torrent"))?;
            let entry = FileEntry {
                length,
                path: vec![name.clone()],
            };
            (vec![entry], length, true)
        };

        let expected_pieces = total_length.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(Error::metainfo(format!(
                "piece count mismatch: have {}, expected {} for {} bytes at {} bytes per piece",
                pieces.len(),
                expected_pieces,
                total_length,
                piece_length
            )));
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            files,
            total_length,
            single_file,
        })
    }

    /// Number of pieces.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Expected SHA-1 for a piece index.
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.pieces.get(index)
    }

    /// Length of a piece; the last piece is the short remainder.
    pub fn piece_length_at(&self, index: usize) -> Option<u32> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_length);
        Some((end - start) as u32)
    }

    pub fn is_single_file(&self) -> bool {
        self.single_file
    }

    /// The declared file layout, in byte-offset order.
    pub fn file_layout(&self) -> &[FileEntry] {
        &self.files
    }
}

fn parse_files(value: &Value) -> Result<(Vec<FileEntry>, u64)> {
    let list = value
        .as_list()
        .ok_or_else(|| Error::metainfo("'files' must be a list"))?;

    let mut files = Vec::with_capacity(list.len());
    let mut total = 0u64;

    for entry in list {
        let length = entry
            .get("length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| Error::metainfo("missing 'length' in file entry"))?;

        let path_list = entry
            .get("path")
            .and_then(|v| v.as_list())
            .ok_or_else(|| Error::metainfo("'path' must be a list of strings"))?;
        if path_list.is_empty() {
            return Err(Error::metainfo("empty 'path' in file entry"));
        }

        let mut path = Vec::with_capacity(path_list.len());
        for component in path_list {
            let component = component
                .as_str()
                .ok_or_else(|| Error::metainfo("path component must be a UTF-8 string"))?;
            path.push(component.to_string());
        }

        total += length;
        files.push(FileEntry { length, path });
    }

    Ok((files, total))
}

/// SHA-1 over the canonical bencoding of an info value.
pub fn hash_info(info: &Value) -> Sha1Hash {
    Sha1::digest(info.encode()).into()
}

/// Render a 20-byte digest as lowercase hex.
pub fn hex_string(hash: &Sha1Hash) -> String {
    hash.iter().map(|b| format!("{b:02x}")).collect()
}
