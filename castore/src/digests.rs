use std::io;
use std::path::Path;
use std::str::FromStr;

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const DIGEST_LEN: usize = 32;

/// SHA-256 digest of an object body, the key into the pool and the remote
/// store. The wire form (manifest `value`, pool filenames, URLs) is the
/// 64-character lower-hex encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CasDigest([u8; DIGEST_LEN]);

#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
    #[error("invalid hex digest: {0:?}")]
    InvalidEncoding(String),
}

impl CasDigest {
    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    /// Digest of an in-memory buffer.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Digest of everything `r` yields, streamed.
    pub fn from_reader<R: io::Read>(r: &mut R) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        io::copy(r, &mut hasher)?;
        Ok(Self(hasher.finalize().into()))
    }

    /// Digest of the contents of the file at `path`.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let mut f = std::fs::File::open(path)?;
        Self::from_reader(&mut f)
    }
}

impl From<[u8; DIGEST_LEN]> for CasDigest {
    fn from(value: [u8; DIGEST_LEN]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for CasDigest {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        value
            .try_into()
            .map(Self)
            .map_err(|_| Error::InvalidDigestLen(value.len()))
    }
}

impl FromStr for CasDigest {
    type Err = Error;

    // parses the 64-character lower-hex wire form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 2 * DIGEST_LEN {
            return Err(Error::InvalidDigestLen(s.len()));
        }
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|_| Error::InvalidEncoding(s.to_string()))?;
        bytes.as_slice().try_into()
    }
}

impl std::fmt::Display for CasDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl std::fmt::Debug for CasDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", HEXLOWER.encode(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HI_DIGEST: &str = "98ea6e4f216f2fb4b69fff9b3a44842c38686ca685f3f55dc48c5d3fb1107be4";
    const EMPTY_DIGEST: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn known_vectors() {
        assert_eq!(CasDigest::from_bytes(b"hi\n").to_string(), HI_DIGEST);
        assert_eq!(CasDigest::from_bytes(b"").to_string(), EMPTY_DIGEST);
    }

    #[test]
    fn parse_roundtrip() {
        let digest: CasDigest = HI_DIGEST.parse().expect("must parse");
        assert_eq!(digest.to_string(), HI_DIGEST);
        assert_eq!(digest, CasDigest::from_bytes(b"hi\n"));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert_eq!("abcd".parse::<CasDigest>(), Err(Error::InvalidDigestLen(4)));
        let upper = HI_DIGEST.to_uppercase();
        assert!(matches!(
            upper.parse::<CasDigest>(),
            Err(Error::InvalidEncoding(_))
        ));
    }

    #[test]
    fn from_reader_matches_from_bytes() {
        let mut r = &b"some longer body with more than one block"[..];
        let streamed = CasDigest::from_reader(&mut r).expect("must hash");
        assert_eq!(
            streamed,
            CasDigest::from_bytes(b"some longer body with more than one block")
        );
    }
}
