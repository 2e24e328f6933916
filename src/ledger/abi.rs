//! Solidity ABI encoding for the handful of types the registry contract uses.

use super::keccak256;

const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address([u8; 20]),
    Uint(u128),
    Bool(bool),
    FixedBytes32([u8; 32]),
    String(String),
    Bytes32Array(Vec<[u8; 32]>),
}

impl Token {
    fn is_dynamic(&self) -> bool {
        matches!(self, Token::String(_) | Token::Bytes32Array(_))
    }

    fn encode_head(&self) -> [u8; WORD] {
        match self {
            Token::Address(addr) => {
                let mut word = [0u8; WORD];
                word[12..].copy_from_slice(addr);
                word
            }
            Token::Uint(value) => uint_word(*value),
            Token::Bool(flag) => uint_word(*flag as u128),
            Token::FixedBytes32(bytes) => *bytes,
            // Dynamic heads are offsets, written by encode_call
            Token::String(_) | Token::Bytes32Array(_) => [0u8; WORD],
        }
    }

    fn encode_tail(&self) -> Vec<u8> {
        match self {
            Token::String(s) => {
                let bytes = s.as_bytes();
                let padded = bytes.len().div_ceil(WORD) * WORD;
                let mut out = Vec::with_capacity(WORD + padded);
                out.extend_from_slice(&uint_word(bytes.len() as u128));
                out.extend_from_slice(bytes);
                out.resize(WORD + padded, 0);
                out
            }
            Token::Bytes32Array(items) => {
                let mut out = Vec::with_capacity(WORD * (items.len() + 1));
                out.extend_from_slice(&uint_word(items.len() as u128));
                for item in items {
                    out.extend_from_slice(item);
                }
                out
            }
            _ => Vec::new(),
        }
    }
}

fn uint_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// First four bytes of the Keccak-256 of the canonical signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let head_len = args.len() * WORD;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();

    for arg in args {
        if arg.is_dynamic() {
            head.extend_from_slice(&uint_word((head_len + tail.len()) as u128));
            tail.extend_from_slice(&arg.encode_tail());
        } else {
            head.extend_from_slice(&arg.encode_head());
        }
    }

    let mut out = Vec::with_capacity(4 + head.len() + tail.len());
    out.extend_from_slice(&selector(signature));
    out.extend_from_slice(&head);
    out.extend_from_slice(&tail);
    out
}

fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * WORD..(index + 1) * WORD)
}

/// Values above `u128::MAX` are rejected rather than truncated.
pub fn decode_uint(data: &[u8], index: usize) -> Option<u128> {
    let w = word(data, index)?;
    if w[..16].iter().any(|b| *b != 0) {
        return None;
    }
    let mut buf = [0u8; 16];
    buf.copy_from_slice(&w[16..]);
    Some(u128::from_be_bytes(buf))
}

pub fn decode_bool(data: &[u8], index: usize) -> Option<bool> {
    decode_uint(data, index).map(|v| v != 0)
}

pub fn decode_address(data: &[u8], index: usize) -> Option<[u8; 20]> {
    let w = word(data, index)?;
    w[12..].try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector() {
        assert_eq!(hex::encode(selector("transfer(address,uint256)")), "a9059cbb");
        assert_eq!(hex::encode(selector("baz(uint32,bool)")), "cdcd77c0");
    }

    #[test]
    fn test_static_arguments() {
        let data = encode_call("baz(uint32,bool)", &[Token::Uint(69), Token::Bool(true)]);
        assert_eq!(
            hex::encode(&data),
            "cdcd77c0\
             0000000000000000000000000000000000000000000000000000000000000045\
             0000000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_dynamic_string_layout() {
        let data = encode_call(
            "f(uint256,string)",
            &[Token::Uint(1), Token::String("dave".into())],
        );
        let args = &data[4..];
        assert_eq!(decode_uint(args, 0), Some(1));
        assert_eq!(decode_uint(args, 1), Some(64)); // offset past two head words
        assert_eq!(decode_uint(args, 2), Some(4)); // length
        assert_eq!(&args[96..100], b"dave");
        assert_eq!(args.len(), 128);
    }

    #[test]
    fn test_bytes32_array_layout() {
        let items = vec![[1u8; 32], [2u8; 32]];
        let data = encode_call("claim(bytes32[])", &[Token::Bytes32Array(items)]);
        let args = &data[4..];
        assert_eq!(decode_uint(args, 0), Some(32));
        assert_eq!(decode_uint(args, 1), Some(2));
        assert_eq!(&args[64..96], &[1u8; 32]);
        assert_eq!(&args[96..128], &[2u8; 32]);
    }

    #[test]
    fn test_decode_rejects_oversized_values() {
        let word = [0xffu8; 32];
        assert_eq!(decode_uint(&word, 0), None);
        assert_eq!(decode_uint(&word, 1), None);
    }
}
