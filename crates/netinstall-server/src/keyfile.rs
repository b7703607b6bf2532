//! Software key export.
//!
//! Devices declare their activation key in the discovery frame. Operators
//! can save it in the armoured text format RouterOS accepts on import.

use crate::error::{NetInstallError, Result};
use crate::hwaddr::MacAddr;
use std::path::{Path, PathBuf};
use tracing::info;

const BEGIN: &str = "-----BEGIN MIKROTIK SOFTWARE KEY------------";
const END: &str = "-----END MIKROTIK SOFTWARE KEY--------------";

/// Characters of key material on the first line
const FIRST_LINE_LEN: usize = 44;

/// Render the key file body, CRLF line endings.
pub fn render_key(key: &str) -> String {
    let split = key
        .char_indices()
        .nth(FIRST_LINE_LEN)
        .map_or(key.len(), |(at, _)| at);
    let (first, second) = key.split_at(split);
    format!("{BEGIN}\r\n{first}\r\n{second}\r\n{END}\r\n")
}

/// `<mac without separators>_<key id>.key`
///
/// The key id comes from the device, so ids that would escape the key
/// directory are refused.
pub fn key_filename(mac: &MacAddr, key_id: &str) -> Result<String> {
    if key_id.is_empty() || key_id.contains(['/', '\\', '\0']) || key_id.contains("..") {
        return Err(NetInstallError::MalformedFrame(format!(
            "{mac} declared unusable key id {key_id:?}"
        )));
    }
    Ok(format!("{}_{}.key", mac.to_compact(), key_id))
}

/// Write the key of a device into `dir`, creating it if needed.
pub async fn write_key_file(
    dir: &Path,
    mac: &MacAddr,
    key_id: &str,
    key: &str,
) -> Result<PathBuf> {
    let path = dir.join(key_filename(mac, key_id)?);
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, render_key(key)).await?;
    info!(mac = %mac, path = %path.display(), "Key saved");
    Ok(path)
}
