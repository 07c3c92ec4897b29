//! Minimal ABI codec for the fixed read-only contract calls
//!
//! Only what the read path needs: calls whose arguments are addresses, and
//! return data that is a `uint8`, a `uint256` that fits in `u128`, an
//! `address[]`, or a `string` (with the legacy `bytes32` form some tokens use
//! for `symbol()`/`name()`).

use crate::error::ReadError;
use crate::types::Address;

const WORD: usize = 32;

/// `decimals()`
pub const DECIMALS: [u8; 4] = [0x31, 0x3c, 0xe5, 0x67];
/// `symbol()`
pub const SYMBOL: [u8; 4] = [0x95, 0xd8, 0x9b, 0x41];
/// `name()`
pub const NAME: [u8; 4] = [0x06, 0xfd, 0xde, 0x03];
/// `balanceOf(address)`
pub const BALANCE_OF: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
/// `getPoolPositions(address,address)`
pub const GET_POOL_POSITIONS: [u8; 4] = [0xc6, 0xea, 0xf4, 0x20];

/// Encode `selector(args...)` as `0x`-prefixed calldata.
pub fn encode_call(selector: [u8; 4], args: &[Address]) -> String {
    let mut data = Vec::with_capacity(4 + args.len() * WORD);
    data.extend_from_slice(&selector);
    for arg in args {
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(arg.as_bytes());
    }
    format!("0x{}", hex::encode(data))
}

/// Decode a `0x`-prefixed hex payload.
pub fn decode_hex(data: &str) -> Result<Vec<u8>, ReadError> {
    let digits = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(digits).map_err(|e| ReadError::Decode(format!("invalid hex: {}", e)))
}

pub fn decode_u8(data: &[u8]) -> Result<u8, ReadError> {
    let word = word_at(data, 0)?;
    if word[..WORD - 1].iter().any(|b| *b != 0) {
        return Err(ReadError::Decode("uint8 value out of range".to_owned()));
    }
    Ok(word[WORD - 1])
}

pub fn decode_u128(data: &[u8]) -> Result<u128, ReadError> {
    let word = word_at(data, 0)?;
    if word[..16].iter().any(|b| *b != 0) {
        return Err(ReadError::Decode("uint256 value exceeds u128".to_owned()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn decode_address_array(data: &[u8]) -> Result<Vec<Address>, ReadError> {
    let offset = usize_at(data, 0)?;
    let len = usize_at(data, offset)?;
    let start = offset + WORD;
    if len > (data.len().saturating_sub(start)) / WORD {
        return Err(ReadError::Decode(format!(
            "address[] claims {} items but only {} bytes follow",
            len,
            data.len().saturating_sub(start)
        )));
    }

    (0..len)
        .map(|i| {
            let word = word_at(data, start + i * WORD)?;
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(&word[12..]);
            Ok(Address::from_bytes(bytes))
        })
        .collect()
}

/// Decode a dynamic `string`, or a NUL-padded `bytes32`.
pub fn decode_string(data: &[u8]) -> Result<String, ReadError> {
    if data.len() == WORD {
        let end = data.iter().position(|b| *b == 0).unwrap_or(WORD);
        return String::from_utf8(data[..end].to_vec())
            .map_err(|e| ReadError::Decode(format!("bytes32 is not utf-8: {}", e)));
    }

    let offset = usize_at(data, 0)?;
    let len = usize_at(data, offset)?;
    let start = offset + WORD;
    let bytes = data
        .get(start..start.saturating_add(len))
        .ok_or_else(|| ReadError::Decode(format!("string of {} bytes is truncated", len)))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ReadError::Decode(format!("string is not utf-8: {}", e)))
}

fn word_at(data: &[u8], offset: usize) -> Result<&[u8], ReadError> {
    data.get(offset..offset.saturating_add(WORD)).ok_or_else(|| {
        ReadError::Decode(format!(
            "expected a 32-byte word at offset {}, payload is {} bytes",
            offset,
            data.len()
        ))
    })
}

fn usize_at(data: &[u8], offset: usize) -> Result<usize, ReadError> {
    let word = word_at(data, offset)?;
    if word[..WORD - 8].iter().any(|b| *b != 0) {
        return Err(ReadError::Decode(format!(
            "offset or length at {} is implausibly large",
            offset
        )));
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[WORD - 8..]);
    usize::try_from(u64::from_be_bytes(low))
        .map_err(|_| ReadError::Decode("length does not fit in usize".to_owned()))
}
