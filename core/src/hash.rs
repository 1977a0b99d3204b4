// SPDX-License-Identifier: MIT

//! The small set of hash algorithms the session layer needs for HMAC
//! computation, abstracted behind one enum so [`crate::session`] does not
//! have to be generic over a digest type.

use digest::Digest;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};

use crate::error::{TpmCoreError, TpmResult};
use crate::types::Algorithm;

/// A hash algorithm usable as a session's name algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    /// The digest size in bytes, also the nonce size this crate generates
    /// for sessions keyed on this algorithm.
    #[must_use]
    pub fn digest_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    #[must_use]
    pub fn algorithm_id(self) -> Algorithm {
        match self {
            Self::Sha1 => Algorithm::Sha1,
            Self::Sha256 => Algorithm::Sha256,
            Self::Sha384 => Algorithm::Sha384,
            Self::Sha512 => Algorithm::Sha512,
        }
    }

    /// Computes the plain digest `H(data)`, used for `cpHash`/`rpHash`
    /// (never an HMAC: those fold command/response parameters, not a
    /// shared secret).
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// Computes `HMAC(key, data)` using this algorithm, returning the raw
    /// tag. `key` is the already-assembled `sessionKey || authValue`
    /// concatenation the session layer builds; this function does not know
    /// or care where `key`'s bytes came from.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] only if the underlying HMAC
    /// construction rejects the key, which `Hmac<D>` never does for any
    /// key length.
    pub fn hmac(self, key: &[u8], data: &[u8]) -> TpmResult<Vec<u8>> {
        fn run<D: Mac>(mac: TpmResult<D>, data: &[u8]) -> TpmResult<Vec<u8>> {
            let mut mac = mac?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        fn new_mac<D: Mac + hmac::digest::KeyInit>(key: &[u8]) -> TpmResult<D> {
            <D as hmac::digest::KeyInit>::new_from_slice(key).map_err(|_| TpmCoreError::Precondition {
                context: "HMAC key construction failed".to_string(),
            })
        }

        match self {
            Self::Sha1 => run(new_mac::<Hmac<Sha1>>(key), data),
            Self::Sha256 => run(new_mac::<Hmac<Sha256>>(key), data),
            Self::Sha384 => run(new_mac::<Hmac<Sha384>>(key), data),
            Self::Sha512 => run(new_mac::<Hmac<Sha512>>(key), data),
        }
    }
}

impl std::str::FromStr for HashAlg {
    type Err = TpmCoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(TpmCoreError::Precondition {
                context: format!("unknown hash algorithm {other:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_sizes_match_the_standard() {
        assert_eq!(HashAlg::Sha1.digest_size(), 20);
        assert_eq!(HashAlg::Sha256.digest_size(), 32);
        assert_eq!(HashAlg::Sha384.digest_size(), 48);
        assert_eq!(HashAlg::Sha512.digest_size(), 64);
    }

    #[test]
    fn hmac_output_length_matches_digest_size() {
        for alg in [HashAlg::Sha1, HashAlg::Sha256, HashAlg::Sha384, HashAlg::Sha512] {
            let tag = alg.hmac(b"key", b"data").unwrap();
            assert_eq!(tag.len(), alg.digest_size());
        }
    }

    #[test]
    fn from_str_is_case_insensitive() {
        assert_eq!("SHA256".parse::<HashAlg>().unwrap(), HashAlg::Sha256);
        assert!("sha224".parse::<HashAlg>().is_err());
    }
}
