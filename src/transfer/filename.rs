//! Wire filename handling
//!
//! Every name a client sends goes through [`validate_filename`] before it is
//! used as a storage key: URL-decode, sanitize, then check the extension.

use crate::error::ValidationError;

/// Longest accepted file name, in bytes
const MAX_FILENAME_LEN: usize = 255;

/// Characters replaced with `_`: path separators and shell metacharacters
const REPLACED_CHARS: &[char] = &[
    '/', '\\', ':', '*', '?', '"', '<', '>', '|', ';', '&', '$', '`', '\'', '!', '(', ')', '{',
    '}', '[', ']', '~', '#', '%', '^',
];

/// Executable and script types that are never stored or served
pub const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "msi", "scr", "pif", "cpl", "dll", "ps1", "psm1", "vbs", "vbe",
    "js", "jse", "wsf", "wsh", "hta", "jar", "sh", "bash", "app", "apk",
];

/// Decode, sanitize and extension-check a filename as sent on the wire.
pub fn validate_filename(raw: &str) -> Result<String, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::MissingFilename);
    }

    let decoded = urlencoding::decode(raw)
        .map_err(|_| ValidationError::UndecodableFilename(raw.to_string()))?;

    let name = sanitize(&decoded)?;

    if is_blocked(&name) {
        return Err(ValidationError::BlockedExtension(name));
    }

    Ok(name)
}

/// Replace disallowed characters and reject names that cannot be keys.
pub fn sanitize(name: &str) -> Result<String, ValidationError> {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_control() || REPLACED_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Trailing dots and spaces are dropped by some filesystems, which would
    // let "malware.exe." slip past the extension check.
    let trimmed = replaced.trim().trim_end_matches(['.', ' ']);

    if trimmed.is_empty() {
        return Err(ValidationError::InvalidFilename(name.to_string()));
    }
    if trimmed.len() > MAX_FILENAME_LEN {
        return Err(ValidationError::InvalidFilename(format!(
            "name exceeds {} bytes",
            MAX_FILENAME_LEN
        )));
    }

    Ok(trimmed.to_string())
}

/// Whether the (sanitized) name carries a blocked extension
pub fn is_blocked(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, ext)) => {
            let ext = ext.to_ascii_lowercase();
            BLOCKED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}
