//! Share and file naming conventions

use crate::error::{Error, Result};
use uuid::Uuid;

/// Prefix of files backing Cinder volumes
pub const VOLUME_FILE_PREFIX: &str = "volume-";

/// Prefix of cached image files
pub const IMAGE_CACHE_PREFIX: &str = "img-cache-";

/// Prefix of temporary group snapshots used to create a group from a group
pub const TEMP_GROUP_SNAPSHOT_PREFIX: &str = "snapshot-temp-";

/// Split an NFS share `host:/junction/path` into host and junction path.
///
/// IPv6 hosts are written in brackets, e.g. `[fd00::1]:/share`.
pub fn split_share(share: &str) -> Result<(&str, &str)> {
    let invalid = || Error::InvalidRequest(format!("Malformed NFS share: {}", share));

    let (host, path) = if let Some(rest) = share.strip_prefix('[') {
        let (host, path) = rest.split_once("]:").ok_or_else(invalid)?;
        (host, path)
    } else {
        share.split_once(':').ok_or_else(invalid)?
    };

    if host.is_empty() || !path.starts_with('/') {
        return Err(invalid());
    }
    Ok((host, path))
}

/// Flexvol name encoded in a `host:/<flexvol>` pool string
pub fn container_from_pool(pool: &str) -> Result<&str> {
    pool.split_once(":/")
        .map(|(_, name)| name)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidRequest(format!("Malformed pool: {}", pool)))
}

/// Volume id of a `volume-<uuid>` file name, if it follows the convention
pub fn volume_id_from_file_name(file_name: &str) -> Option<Uuid> {
    file_name
        .strip_prefix(VOLUME_FILE_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// Backend path of a file inside a flexvol
pub fn backend_file_path(container: &str, file_name: &str) -> String {
    format!("/vol/{}/{}", container, file_name)
}
