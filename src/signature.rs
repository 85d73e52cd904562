//! Signature assembly
//!
//! Turns raw engine output into wallet-consumable signatures:
//!
//! - ECDSA: `r(32) || s(32) || recovery(1)` becomes a compact
//!   `0x{r}{s}{recovery}` string plus a DER `SEQUENCE { INTEGER r, INTEGER s }`
//! - EdDSA/Schnorr: `r(32) || s(32)` becomes `hex(r) || hex(s)`

use crate::types::{KeysignSignature, SignatureAlgorithm};
use thiserror::Error;

const SCALAR_LEN: usize = 32;
const DER_SEQUENCE: u8 = 0x30;
const DER_INTEGER: u8 = 0x02;

/// Signature assembly errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid raw signature length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid DER signature: {0}")]
    InvalidDer(String),
}

/// Assemble raw engine output for the given scheme
pub fn assemble(
    algorithm: SignatureAlgorithm,
    raw: &[u8],
) -> Result<KeysignSignature, SignatureError> {
    match algorithm {
        SignatureAlgorithm::Ecdsa => assemble_ecdsa(raw),
        SignatureAlgorithm::Eddsa => assemble_eddsa(raw),
    }
}

pub fn assemble_ecdsa(raw: &[u8]) -> Result<KeysignSignature, SignatureError> {
    if raw.len() != SCALAR_LEN * 2 + 1 {
        return Err(SignatureError::InvalidLength {
            expected: SCALAR_LEN * 2 + 1,
            actual: raw.len(),
        });
    }
    let (r, rest) = raw.split_at(SCALAR_LEN);
    let (s, recovery) = rest.split_at(SCALAR_LEN);

    let r_hex = hex::encode(r);
    let s_hex = hex::encode(s);
    let recovery_hex = hex::encode(recovery);

    Ok(KeysignSignature {
        algorithm: SignatureAlgorithm::Ecdsa,
        signature: format!("0x{}{}{}", r_hex, s_hex, recovery_hex),
        der_signature: Some(hex::encode(encode_der(r, s))),
        recovery_id: Some(recovery_hex),
        r: r_hex,
        s: s_hex,
    })
}

pub fn assemble_eddsa(raw: &[u8]) -> Result<KeysignSignature, SignatureError> {
    if raw.len() != SCALAR_LEN * 2 {
        return Err(SignatureError::InvalidLength {
            expected: SCALAR_LEN * 2,
            actual: raw.len(),
        });
    }
    let (r, s) = raw.split_at(SCALAR_LEN);
    let r_hex = hex::encode(r);
    let s_hex = hex::encode(s);

    Ok(KeysignSignature {
        algorithm: SignatureAlgorithm::Eddsa,
        signature: format!("{}{}", r_hex, s_hex),
        der_signature: None,
        recovery_id: None,
        r: r_hex,
        s: s_hex,
    })
}

/// DER-encode an `(r, s)` pair of big-endian unsigned integers
///
/// A `0x00` byte is prepended to an integer whose leading byte has the high
/// bit set. Leading zero bytes are kept as they are.
pub fn encode_der(r: &[u8], s: &[u8]) -> Vec<u8> {
    let r = der_integer(r);
    let s = der_integer(s);

    let mut out = Vec::with_capacity(2 + r.len() + s.len());
    out.push(DER_SEQUENCE);
    out.push((r.len() + s.len()) as u8);
    out.extend_from_slice(&r);
    out.extend_from_slice(&s);
    out
}

fn der_integer(value: &[u8]) -> Vec<u8> {
    let pad = value.first().map_or(false, |b| b & 0x80 != 0);
    let len = value.len() + usize::from(pad);

    let mut out = Vec::with_capacity(2 + len);
    out.push(DER_INTEGER);
    out.push(len as u8);
    if pad {
        out.push(0x00);
    }
    out.extend_from_slice(value);
    out
}

/// Decode a DER `(r, s)` pair back into 32-byte big-endian scalars
pub fn decode_der(der: &[u8]) -> Result<([u8; SCALAR_LEN], [u8; SCALAR_LEN]), SignatureError> {
    let invalid = |msg: &str| SignatureError::InvalidDer(msg.to_string());

    if der.len() < 2 || der[0] != DER_SEQUENCE {
        return Err(invalid("missing SEQUENCE tag"));
    }
    if der[1] as usize != der.len() - 2 {
        return Err(invalid("SEQUENCE length mismatch"));
    }

    let (r, rest) = read_integer(&der[2..])?;
    let (s, rest) = read_integer(rest)?;
    if !rest.is_empty() {
        return Err(invalid("trailing bytes"));
    }
    Ok((r, s))
}

fn read_integer(input: &[u8]) -> Result<([u8; SCALAR_LEN], &[u8]), SignatureError> {
    if input.len() < 2 || input[0] != DER_INTEGER {
        return Err(SignatureError::InvalidDer("missing INTEGER tag".to_string()));
    }
    let len = input[1] as usize;
    if input.len() < 2 + len || len == 0 {
        return Err(SignatureError::InvalidDer("truncated INTEGER".to_string()));
    }
    let (value, rest) = input[2..].split_at(len);

    // drop the sign padding, then left-pad to the scalar width
    let value = match value {
        [0x00, next, ..] if next & 0x80 != 0 => &value[1..],
        _ => value,
    };
    if value.len() > SCALAR_LEN {
        return Err(SignatureError::InvalidDer("INTEGER wider than 32 bytes".to_string()));
    }

    let mut out = [0u8; SCALAR_LEN];
    out[SCALAR_LEN - value.len()..].copy_from_slice(value);
    Ok((out, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_ecdsa(r_first: u8, s_first: u8, recovery: u8) -> Vec<u8> {
        let mut raw = vec![0x11u8; 65];
        raw[0] = r_first;
        raw[32] = s_first;
        raw[64] = recovery;
        raw
    }

    #[test]
    fn test_ecdsa_compact_format() {
        let sig = assemble_ecdsa(&raw_ecdsa(0x01, 0x02, 0x01)).unwrap();
        assert!(sig.signature.starts_with("0x01"));
        assert_eq!(sig.signature.len(), 2 + 130);
        assert!(sig.signature.ends_with("01"));
        assert_eq!(sig.recovery_id.as_deref(), Some("01"));
        assert_eq!(&sig.s[..2], "02");
    }

    #[test]
    fn test_der_padding_only_when_high_bit_set() {
        let plain = encode_der(&[0x7f; 32], &[0x01; 32]);
        assert_eq!(plain[0], DER_SEQUENCE);
        assert_eq!(plain[1] as usize, plain.len() - 2);
        assert_eq!(&plain[2..4], &[DER_INTEGER, 32]);
        assert_eq!(plain.len(), 2 + 34 + 34);

        let padded = encode_der(&[0x80; 32], &[0xff; 32]);
        assert_eq!(&padded[2..5], &[DER_INTEGER, 33, 0x00]);
        assert_eq!(&padded[37..40], &[DER_INTEGER, 33, 0x00]);
        assert_eq!(padded.len(), 2 + 35 + 35);
        assert_eq!(padded[1], 70);
    }

    #[test]
    fn test_der_round_trip() {
        for (r0, s0) in [(0x00u8, 0x7fu8), (0x80, 0x01), (0xff, 0xc3), (0x12, 0x34)] {
            let raw = raw_ecdsa(r0, s0, 0);
            let sig = assemble_ecdsa(&raw).unwrap();
            let der = hex::decode(sig.der_signature.unwrap()).unwrap();
            let (r, s) = decode_der(&der).unwrap();
            assert_eq!(&r[..], &raw[..32]);
            assert_eq!(&s[..], &raw[32..64]);
        }
    }

    #[test]
    fn test_eddsa_format() {
        let mut raw = vec![0xaau8; 32];
        raw.extend_from_slice(&[0xbbu8; 32]);
        let sig = assemble_eddsa(&raw).unwrap();
        assert_eq!(sig.signature, format!("{}{}", "aa".repeat(32), "bb".repeat(32)));
        assert!(sig.der_signature.is_none());
        assert!(sig.recovery_id.is_none());
    }

    #[test]
    fn test_length_validation() {
        assert_eq!(
            assemble(SignatureAlgorithm::Ecdsa, &[0u8; 64]),
            Err(SignatureError::InvalidLength {
                expected: 65,
                actual: 64
            })
        );
        assert!(assemble(SignatureAlgorithm::Eddsa, &[0u8; 65]).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_der(&[]).is_err());
        assert!(decode_der(&[0x30, 0x03, 0x02, 0x01]).is_err());
        assert!(decode_der(&[0x31, 0x00]).is_err());
    }
}
