//! Purpose: Name-selected hash algorithms and the `Digest` value type.
//! Exports: `HashAlgorithm`, `Digest`.
//! Role: Pure bytes -> digest function shared by encoder and reader.
//! Invariants: Algorithm ids are persisted in encoded files; never renumber them.
//! Invariants: Digests are the algorithm's full native output, never truncated.
use std::fmt;
use std::str::FromStr;

use blake2::{Blake2b512, Blake2s256};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as _, Sha224, Sha256, Sha384, Sha512};
use sha3::{Sha3_224, Sha3_256, Sha3_384, Sha3_512};

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha3_224,
    Sha3_256,
    Sha3_384,
    Sha3_512,
    Blake2b,
    Blake2s,
}

pub const DEFAULT_ALGORITHM: HashAlgorithm = HashAlgorithm::Md5;

const ALL: [HashAlgorithm; 12] = [
    HashAlgorithm::Md5,
    HashAlgorithm::Sha1,
    HashAlgorithm::Sha224,
    HashAlgorithm::Sha256,
    HashAlgorithm::Sha384,
    HashAlgorithm::Sha512,
    HashAlgorithm::Sha3_224,
    HashAlgorithm::Sha3_256,
    HashAlgorithm::Sha3_384,
    HashAlgorithm::Sha3_512,
    HashAlgorithm::Blake2b,
    HashAlgorithm::Blake2s,
];

impl HashAlgorithm {
    pub fn all() -> &'static [HashAlgorithm] {
        &ALL
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Sha3_224 => "sha3_224",
            HashAlgorithm::Sha3_256 => "sha3_256",
            HashAlgorithm::Sha3_384 => "sha3_384",
            HashAlgorithm::Sha3_512 => "sha3_512",
            HashAlgorithm::Blake2b => "blake2b",
            HashAlgorithm::Blake2s => "blake2s",
        }
    }

    pub fn id(self) -> u16 {
        match self {
            HashAlgorithm::Md5 => 1,
            HashAlgorithm::Sha1 => 2,
            HashAlgorithm::Sha224 => 3,
            HashAlgorithm::Sha256 => 4,
            HashAlgorithm::Sha384 => 5,
            HashAlgorithm::Sha512 => 6,
            HashAlgorithm::Sha3_224 => 7,
            HashAlgorithm::Sha3_256 => 8,
            HashAlgorithm::Sha3_384 => 9,
            HashAlgorithm::Sha3_512 => 10,
            HashAlgorithm::Blake2b => 11,
            HashAlgorithm::Blake2s => 12,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        ALL.iter().copied().find(|alg| alg.id() == id)
    }

    pub fn from_name(name: &str) -> Result<Self, Error> {
        let wanted = name.trim().to_ascii_lowercase().replace('-', "_");
        ALL.iter()
            .copied()
            .find(|alg| alg.name() == wanted)
            .ok_or_else(|| {
                let names = ALL.iter().map(|alg| alg.name()).collect::<Vec<_>>().join(", ");
                Error::new(ErrorKind::Configuration)
                    .with_message(format!("unsupported hash algorithm '{name}'"))
                    .with_hint(format!("Available algorithms: {names}."))
            })
    }

    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha224 | HashAlgorithm::Sha3_224 => 28,
            HashAlgorithm::Sha256 | HashAlgorithm::Sha3_256 | HashAlgorithm::Blake2s => 32,
            HashAlgorithm::Sha384 | HashAlgorithm::Sha3_384 => 48,
            HashAlgorithm::Sha512 | HashAlgorithm::Sha3_512 | HashAlgorithm::Blake2b => 64,
        }
    }

    pub fn digest(self, bytes: &[u8]) -> Digest {
        let out = match self {
            HashAlgorithm::Md5 => Md5::digest(bytes).to_vec(),
            HashAlgorithm::Sha1 => Sha1::digest(bytes).to_vec(),
            HashAlgorithm::Sha224 => Sha224::digest(bytes).to_vec(),
            HashAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(bytes).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(bytes).to_vec(),
            HashAlgorithm::Sha3_224 => Sha3_224::digest(bytes).to_vec(),
            HashAlgorithm::Sha3_256 => Sha3_256::digest(bytes).to_vec(),
            HashAlgorithm::Sha3_384 => Sha3_384::digest(bytes).to_vec(),
            HashAlgorithm::Sha3_512 => Sha3_512::digest(bytes).to_vec(),
            HashAlgorithm::Blake2b => Blake2b512::digest(bytes).to_vec(),
            HashAlgorithm::Blake2s => Blake2s256::digest(bytes).to_vec(),
        };
        Digest(out)
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s)
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hash output; ordering is bytewise and defines index order.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Digest(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.0.len() * 2);
        for byte in &self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::{HashAlgorithm, DEFAULT_ALGORITHM};
    use crate::core::error::ErrorKind;

    #[test]
    fn known_vectors() {
        assert_eq!(
            HashAlgorithm::Md5.digest(b"abc").to_hex(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            HashAlgorithm::Sha256.digest(b"abc").to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn output_len_matches_digest() {
        for alg in HashAlgorithm::all() {
            assert_eq!(alg.digest(b"x").len(), alg.output_len(), "{alg}");
        }
    }

    #[test]
    fn names_and_ids_round_trip() {
        for alg in HashAlgorithm::all() {
            assert_eq!(HashAlgorithm::from_name(alg.name()).expect("name"), *alg);
            assert_eq!(HashAlgorithm::from_id(alg.id()), Some(*alg));
        }
        assert_eq!(HashAlgorithm::from_name("SHA3-256").expect("alias"), HashAlgorithm::Sha3_256);
        assert_eq!(DEFAULT_ALGORITHM.name(), "md5");
        assert_eq!(HashAlgorithm::from_id(0), None);
    }

    #[test]
    fn unknown_name_is_configuration_error() {
        let err = HashAlgorithm::from_name("crc32").expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.hint().unwrap_or_default().contains("sha256"));
    }
}
