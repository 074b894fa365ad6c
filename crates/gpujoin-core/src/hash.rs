//! Stable hashing helpers: program fingerprints and the 32-bit join-key hash.

use blake3::Hasher;
use serde::Serialize;

use crate::types::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash256 {
    let mut h = Hasher::new();
    h.update(bytes);
    Hash256(h.finalize().into())
}

/// Hash any serde-serializable value deterministically (via JSON).
pub fn hash_serde<T: Serialize>(v: &T) -> Result<Hash256, crate::error::Error> {
    let bytes = serde_json::to_vec(v).map_err(|e| crate::error::Error::Fingerprint(e.to_string()))?;
    Ok(hash_bytes(&bytes))
}

/// 32-bit hash of a join key.
///
/// Values that compare equal under [`Scalar::sql_eq`] hash equally: integers
/// of any width and integral floats share one representation.
pub fn hash_join_key<'a>(keys: impl IntoIterator<Item = &'a Scalar>) -> u32 {
    let mut h = Hasher::new();
    for k in keys {
        hash_key_scalar(k, &mut h);
    }
    let out = h.finalize();
    let b = out.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn hash_key_scalar(scalar: &Scalar, h: &mut Hasher) {
    match scalar {
        Scalar::Null => {
            h.update(&[0]);
        }
        Scalar::Bool(b) => {
            h.update(&[1, *b as u8]);
        }
        Scalar::I32(_) | Scalar::I64(_) | Scalar::F32(_) | Scalar::F64(_) => {
            let f = scalar.as_f64().unwrap_or(f64::NAN);
            if f.fract() == 0.0 && f.abs() < 9.0e15 {
                h.update(&[2]);
                h.update(&(f as i64).to_le_bytes());
            } else {
                h.update(&[3]);
                h.update(&f.to_bits().to_le_bytes());
            }
        }
        Scalar::Str(s) => {
            h.update(&[4]);
            h.update(&(s.len() as u32).to_le_bytes());
            h.update(s.as_bytes());
        }
        Scalar::Bin(b) => {
            h.update(&[5]);
            h.update(&(b.len() as u32).to_le_bytes());
            h.update(b);
        }
    }
}
