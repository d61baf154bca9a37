//! Little-endian cursor codec. Every wire integer in the protocol passes
//! through these helpers, so byte order and field widths are defined in
//! exactly one place.

use solana_program::pubkey::Pubkey;

use crate::error::LarderError;

pub fn read_u8(input: &mut &[u8]) -> Result<u8, LarderError> {
    let (&val, rest) = input.split_first().ok_or(LarderError::MalformedRecord)?;
    *input = rest;
    Ok(val)
}

pub fn read_u16(input: &mut &[u8]) -> Result<u16, LarderError> {
    if input.len() < 2 {
        return Err(LarderError::MalformedRecord);
    }
    let (bytes, rest) = input.split_at(2);
    *input = rest;
    Ok(u16::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_u64(input: &mut &[u8]) -> Result<u64, LarderError> {
    if input.len() < 8 {
        return Err(LarderError::MalformedRecord);
    }
    let (bytes, rest) = input.split_at(8);
    *input = rest;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_u128(input: &mut &[u8]) -> Result<u128, LarderError> {
    if input.len() < 16 {
        return Err(LarderError::MalformedRecord);
    }
    let (bytes, rest) = input.split_at(16);
    *input = rest;
    Ok(u128::from_le_bytes(bytes.try_into().unwrap()))
}

pub fn read_pubkey(input: &mut &[u8]) -> Result<Pubkey, LarderError> {
    if input.len() < 32 {
        return Err(LarderError::MalformedRecord);
    }
    let (bytes, rest) = input.split_at(32);
    *input = rest;
    Ok(Pubkey::new_from_array(bytes.try_into().unwrap()))
}

/// Take `n` opaque bytes (reserved regions, order-book slabs).
pub fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], LarderError> {
    if input.len() < n {
        return Err(LarderError::MalformedRecord);
    }
    let (bytes, rest) = input.split_at(n);
    *input = rest;
    Ok(bytes)
}

pub fn write_u8(val: u8, buf: &mut Vec<u8>) {
    buf.push(val);
}

pub fn write_u16(val: u16, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub fn write_u64(val: u64, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub fn write_u128(val: u128, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&val.to_le_bytes());
}

pub fn write_pubkey(val: &Pubkey, buf: &mut Vec<u8>) {
    buf.extend_from_slice(val.as_ref());
}

pub fn write_bytes(val: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(val);
}
