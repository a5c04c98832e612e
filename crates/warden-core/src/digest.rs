//! Content-addressing helpers shared by the artifact store, catalog, and downloader.

/// Format raw SHA-256 bytes as the `sha256:<hex>` digest string used throughout the catalog.
#[must_use]
pub fn format_sha256(bytes: &[u8; 32]) -> String {
    let mut hex = String::with_capacity(7 + 64);
    hex.push_str("sha256:");
    for b in bytes {
        hex.push_str(&format!("{b:02x}"));
    }
    hex
}

/// Parse a `sha256:<hex>` digest string back into raw bytes. Returns `None` if the
/// prefix is wrong or the hex payload isn't exactly 32 bytes.
#[must_use]
pub fn parse_sha256(digest: &str) -> Option<[u8; 32]> {
    let hex = digest.strip_prefix("sha256:")?;
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(out)
}
