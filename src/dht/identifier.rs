use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// 标识符字节长度 (192 bit)
pub const CID_BYTES: usize = 24;

/// 标识符比特数
pub const ID_BITS: usize = CID_BYTES * 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("Invalid length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// Client identifier of a peer in the overlay.
///
/// Identifiers are ordered as unsigned big-endian integers, which is also the
/// order used when comparing XOR distances.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cid(pub [u8; CID_BYTES]);

/// Tiger tree hash of shared content. Shares the identifier space with CIDs.
pub type Tth = Cid;

/// XOR distance between two identifiers
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Distance(pub [u8; CID_BYTES]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Number of leading zero bits, `ID_BITS` for a zero distance
    pub fn leading_zeros(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }
}

impl Cid {
    /// Generates a random identifier
    pub fn random() -> Self {
        let mut id = [0u8; CID_BYTES];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut id);
        Self(id)
    }

    /// Derives the public identifier from a private one.
    ///
    /// The private id never leaves this host; peers only ever see the hash.
    pub fn from_pid(pid: &Cid) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, &pid.0);

        let mut id = [0u8; CID_BYTES];
        id.copy_from_slice(&digest.as_ref()[..CID_BYTES]);

        Self(id)
    }

    /// Calculates the XOR distance between two identifiers
    pub fn distance(&self, other: &Self) -> Distance {
        let mut result = [0u8; CID_BYTES];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(result)
    }

    /// Number of leading bits shared with `other`
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Returns bit `index`, counted from the most significant bit
    pub fn bit(&self, index: usize) -> bool {
        let byte = self.0[index / 8];
        byte & (0x80 >> (index % 8)) != 0
    }

    pub fn as_bytes(&self) -> &[u8; CID_BYTES] {
        &self.0
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for Cid {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IdentifierError::InvalidHex(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for Cid {
    type Error = IdentifierError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != CID_BYTES {
            return Err(IdentifierError::InvalidLength {
                expected: CID_BYTES,
                actual: bytes.len(),
            });
        }

        let mut id = [0u8; CID_BYTES];
        id.copy_from_slice(bytes);

        Ok(Self(id))
    }
}

// 序列化为十六进制字符串，快照文件保持可读
impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid_with_first_byte(b: u8) -> Cid {
        let mut id = [0u8; CID_BYTES];
        id[0] = b;
        Cid(id)
    }

    #[test]
    fn test_distance_symmetric_and_zero_on_self() {
        for _ in 0..32 {
            let a = Cid::random();
            let b = Cid::random();
            assert_eq!(a.distance(&b), b.distance(&a));
            assert!(a.distance(&a).is_zero());
            if a != b {
                assert!(!a.distance(&b).is_zero());
            }
        }
    }

    #[test]
    fn test_common_prefix_len() {
        let zero = Cid::default();
        assert_eq!(zero.common_prefix_len(&cid_with_first_byte(0x80)), 0);
        assert_eq!(zero.common_prefix_len(&cid_with_first_byte(0x01)), 7);
        assert_eq!(zero.common_prefix_len(&zero), ID_BITS);

        let mut id = [0u8; CID_BYTES];
        id[1] = 0x40;
        assert_eq!(zero.common_prefix_len(&Cid(id)), 9);
    }

    #[test]
    fn test_distance_ordering_is_unsigned_magnitude() {
        let target = Cid::default();
        let near = cid_with_first_byte(0x01);
        let far = cid_with_first_byte(0x80);
        assert!(near.distance(&target) < far.distance(&target));
    }

    #[test]
    fn test_bit_access() {
        let id = cid_with_first_byte(0b1010_0000);
        assert!(id.bit(0));
        assert!(!id.bit(1));
        assert!(id.bit(2));
        assert!(!id.bit(191));
    }

    #[test]
    fn test_hex_parsing() {
        let id = Cid::random();
        let parsed: Cid = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string().len(), CID_BYTES * 2);

        assert!(matches!(
            "abcd".parse::<Cid>(),
            Err(IdentifierError::InvalidLength { expected: 24, actual: 2 })
        ));
        assert!(matches!("zz".parse::<Cid>(), Err(IdentifierError::InvalidHex(_))));
    }

    #[test]
    fn test_from_pid_is_stable() {
        let pid = Cid::random();
        assert_eq!(Cid::from_pid(&pid), Cid::from_pid(&pid));
        assert_ne!(Cid::from_pid(&pid), pid);
    }
}
