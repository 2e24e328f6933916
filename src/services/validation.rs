//! Input checks shared by handlers and services. Every failure is a
//! `Validation` error.

use crate::error::{AppError, Result};
use crate::ledger::parse_address;

pub const MAX_CID_LEN: usize = 128;
pub const MAX_FILE_NAME_LEN: usize = 255;
/// One year
pub const MAX_GRANT_DURATION_SECS: u64 = 365 * 24 * 60 * 60;
pub const MAX_BATCH_CLAIM: usize = 100;

/// Accepts `0x` + 40 hex characters and returns the lowercase form.
pub fn address(value: &str) -> Result<String> {
    if !value.starts_with("0x") || parse_address(value).is_none() {
        return Err(AppError::Validation(format!("Invalid address: {}", value)));
    }
    Ok(value.to_lowercase())
}

/// `0x`-optional, 65 bytes as hex
pub fn signature(value: &str) -> Result<()> {
    let hex_part = value.strip_prefix("0x").unwrap_or(value);
    if hex_part.len() != 130 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AppError::Validation("Invalid signature format".to_string()));
    }
    Ok(())
}

pub fn cid(value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value.len() <= MAX_CID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(AppError::Validation(format!("Invalid content identifier: {}", value)));
    }
    Ok(())
}

/// Strip path separators and control characters, then bound the length.
pub fn file_name(value: &str) -> Result<String> {
    let sanitized: String = value
        .chars()
        .filter(|c| !matches!(c, '/' | '\\') && !c.is_control())
        .collect();
    let sanitized = sanitized.trim().to_string();

    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return Err(AppError::Validation("File name is required".to_string()));
    }
    if sanitized.chars().count() > MAX_FILE_NAME_LEN {
        return Err(AppError::Validation(format!(
            "File name exceeds {} characters",
            MAX_FILE_NAME_LEN
        )));
    }
    Ok(sanitized)
}

pub fn payload(data: &[u8], max_bytes: usize) -> Result<()> {
    if data.is_empty() {
        return Err(AppError::Validation("File is empty".to_string()));
    }
    if data.len() > max_bytes {
        return Err(AppError::Validation(format!(
            "File exceeds maximum size of {} bytes",
            max_bytes
        )));
    }
    Ok(())
}

pub fn grant_duration(secs: u64) -> Result<()> {
    if secs > MAX_GRANT_DURATION_SECS {
        return Err(AppError::Validation(
            "Grant duration cannot exceed one year".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address() {
        assert_eq!(
            address("0x00000000000000000000000000000000000000AB").unwrap(),
            "0x00000000000000000000000000000000000000ab"
        );
        assert!(address("00000000000000000000000000000000000000ab").is_err());
        assert!(address("0x1234").is_err());
        assert!(address("0xzz000000000000000000000000000000000000ab").is_err());
    }

    #[test]
    fn test_signature() {
        assert!(signature(&format!("0x{}", "a".repeat(130))).is_ok());
        assert!(signature(&"F".repeat(130)).is_ok());
        assert!(signature(&format!("0x{}", "a".repeat(128))).is_err());
        assert!(signature(&format!("0x{}", "g".repeat(130))).is_err());
    }

    #[test]
    fn test_cid() {
        assert!(cid("bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi").is_ok());
        assert!(cid("a1b2-c3_d4").is_ok());
        assert!(cid("").is_err());
        assert!(cid("../etc/passwd").is_err());
        assert!(cid(&"a".repeat(MAX_CID_LEN + 1)).is_err());
    }

    #[test]
    fn test_file_name_sanitization() {
        assert_eq!(file_name("../../etc/passwd").unwrap(), "....etcpasswd");
        assert_eq!(file_name("report\u{0}.pdf").unwrap(), "report.pdf");
        assert_eq!(file_name("  notes.txt ").unwrap(), "notes.txt");
        assert!(file_name("//").is_err());
        assert!(file_name("..").is_err());
        assert!(file_name(&"x".repeat(MAX_FILE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_payload_bounds() {
        assert!(payload(b"", 10).is_err());
        assert!(payload(b"0123456789", 10).is_ok());
        assert!(payload(b"0123456789a", 10).is_err());
    }

    #[test]
    fn test_grant_duration() {
        assert!(grant_duration(0).is_ok());
        assert!(grant_duration(MAX_GRANT_DURATION_SECS).is_ok());
        assert!(grant_duration(MAX_GRANT_DURATION_SECS + 1).is_err());
    }
}
