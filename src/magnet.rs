//! Magnet URI parsing.
//!
//! Format: `magnet:?xt=urn:btih:<40 hex chars>&tr=<tracker>&dn=<name>`.
//! Only the infohash is required; unknown query parameters are ignored.

use crate::error::{Error, Result};
use crate::metainfo::{hex_string, Sha1Hash};

/// A parsed magnet link. Carries no `Info`; the metadata is fetched from
/// peers via ut_metadata and verified against `info_hash`.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// Tracker URL from the first `tr` parameter, if any.
    pub tracker_url: Option<String>,
    /// Info hash decoded from `xt=urn:btih:<hex>`.
    pub info_hash: Sha1Hash,
    /// Display name from the `dn` parameter, if any.
    pub display_name: Option<String>,
}

impl MagnetLink {
    /// Parse a magnet URI string.
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| Error::magnet("URI must start with 'magnet:?'"))?;

        let mut info_hash = None;
        let mut tracker_url = None;
        let mut display_name = None;

        for param in query.split('&') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            match key {
                "xt" => {
                    let hex = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| Error::magnet("'xt' is not a urn:btih topic"))?;
                    info_hash = Some(decode_hex_digest(hex)?);
                }
                "tr" => {
                    if tracker_url.is_none() {
                        tracker_url = Some(percent_decode(value));
                    }
                }
                "dn" => {
                    display_name = Some(percent_decode(value));
                }
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| Error::magnet("missing 'xt' parameter (info hash)"))?;

        Ok(Self {
            tracker_url,
            info_hash,
            display_name,
        })
    }

    /// Infohash rendered as 40 lowercase hex characters.
    pub fn info_hash_hex(&self) -> String {
        hex_string(&self.info_hash)
    }

    /// Display name, falling back to the hex infohash.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash_hex())
    }
}

/// Decode a 40-character hex digest to 20 bytes.
fn decode_hex_digest(hex: &str) -> Result<Sha1Hash> {
    if hex.len() != 40 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::magnet(format!("invalid btih digest: {hex:?}")));
    }
    let mut hash = [0u8; 20];
    for (i, byte) in hash.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| Error::magnet("invalid hex in btih digest"))?;
    }
    Ok(hash)
}

/// Percent-decode a query parameter value. `+` decodes to a space.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&value[i + 1..i + 3], 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
