//! Minimal RLP encoder for legacy transactions.

pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return bytes.to_vec();
    }
    let mut out = length_prefix(bytes.len(), 0x80);
    out.extend_from_slice(bytes);
    out
}

/// Big-endian with leading zeros stripped; zero encodes as the empty string.
pub fn encode_uint(value: u128) -> Vec<u8> {
    encode_bytes(trim_leading_zeros(&value.to_be_bytes()))
}

pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(|i| i.len()).sum();
    let mut out = length_prefix(payload_len, 0xc0);
    out.reserve(payload_len);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

pub fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

fn length_prefix(len: usize, offset: u8) -> Vec<u8> {
    if len <= 55 {
        return vec![offset + len as u8];
    }
    let len_bytes = trim_leading_zeros(&len.to_be_bytes()).to_vec();
    let mut out = vec![offset + 55 + len_bytes.len() as u8];
    out.extend_from_slice(&len_bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_strings() {
        assert_eq!(encode_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(encode_bytes(b""), vec![0x80]);
        assert_eq!(encode_bytes(&[0x0f]), vec![0x0f]);
        assert_eq!(encode_bytes(&[0x80]), vec![0x81, 0x80]);
    }

    #[test]
    fn test_encode_integers() {
        assert_eq!(encode_uint(0), vec![0x80]);
        assert_eq!(encode_uint(15), vec![0x0f]);
        assert_eq!(encode_uint(1024), vec![0x82, 0x04, 0x00]);
    }

    #[test]
    fn test_encode_list() {
        let list = encode_list(&[encode_bytes(b"cat"), encode_bytes(b"dog")]);
        assert_eq!(list, vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']);
        assert_eq!(encode_list(&[]), vec![0xc0]);
    }

    #[test]
    fn test_long_string() {
        let data = vec![b'a'; 56];
        let encoded = encode_bytes(&data);
        assert_eq!(&encoded[..2], &[0xb8, 56]);
        assert_eq!(encoded.len(), 58);
    }
}
