//! Hash Verifier
//!
//! Incremental digest check used per chunk and over the assembled file.
//!
//! Accepted digest encodings:
//! - hex SHA-256 (64 chars) or hex SHA-512 (128 chars)
//! - multibase multihash, base58btc (`z` prefix) or unpadded base64 (`m`
//!   prefix), over sha2-256, sha2-512, blake2b-512 or blake2s-256
//!
//! Content ids issued upstream are base58btc blake2b-512 multihashes, so an
//! upload finalized without a body verifies against its own id.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use blake2::{Blake2b512, Blake2s256};
use sha2::{Digest, Sha256, Sha512};

/// Integrity failures, terminal for a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("unsupported digest format: {0}")]
    UnsupportedDigest(String),

    #[error("digest mismatch: expected {expected}, computed {actual}")]
    Mismatch { expected: String, actual: String },

    #[error("assembled chunks are not contiguous at offset {0}")]
    Gap(u64),

    #[error("assembled size {actual} does not match declared size {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("no chunks to assemble")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
    Blake2b512,
    Blake2s256,
}

impl DigestAlgorithm {
    /// Code in the multihash table
    fn multihash_code(self) -> u64 {
        match self {
            Self::Sha256 => 0x12,
            Self::Sha512 => 0x13,
            Self::Blake2b512 => 0xb240,
            Self::Blake2s256 => 0xb260,
        }
    }

    fn from_multihash_code(code: u64) -> Option<Self> {
        [Self::Sha256, Self::Sha512, Self::Blake2b512, Self::Blake2s256]
            .into_iter()
            .find(|alg| alg.multihash_code() == code)
    }

    /// Digest length in bytes
    fn digest_len(self) -> usize {
        match self {
            Self::Sha256 | Self::Blake2s256 => 32,
            Self::Sha512 | Self::Blake2b512 => 64,
        }
    }

    fn hasher(self) -> Hasher {
        match self {
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
            Self::Sha512 => Hasher::Sha512(Sha512::new()),
            Self::Blake2b512 => Hasher::Blake2b512(Blake2b512::new()),
            Self::Blake2s256 => Hasher::Blake2s256(Blake2s256::new()),
        }
    }
}

/// Multibase alphabets we read and write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multibase {
    Base58Btc,
    Base64,
}

impl Multibase {
    fn from_prefix(prefix: char) -> Option<Self> {
        match prefix {
            'z' => Some(Self::Base58Btc),
            'm' => Some(Self::Base64),
            _ => None,
        }
    }

    fn prefix(self) -> char {
        match self {
            Self::Base58Btc => 'z',
            Self::Base64 => 'm',
        }
    }

    fn encode(self, bytes: &[u8]) -> String {
        let body = match self {
            Self::Base58Btc => bs58::encode(bytes).into_string(),
            Self::Base64 => STANDARD_NO_PAD.encode(bytes),
        };
        format!("{}{}", self.prefix(), body)
    }

    fn decode(self, body: &str) -> Option<Vec<u8>> {
        match self {
            Self::Base58Btc => bs58::decode(body).into_vec().ok(),
            Self::Base64 => STANDARD_NO_PAD.decode(body).ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Hex,
    Multibase(Multibase),
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
    Blake2b512(Blake2b512),
    Blake2s256(Blake2s256),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Blake2b512(h) => h.update(data),
            Self::Blake2s256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
            Self::Blake2b512(h) => h.finalize().to_vec(),
            Self::Blake2s256(h) => h.finalize().to_vec(),
        }
    }
}

/// Streams bytes through the digest named by the expected value
pub struct HashVerifier {
    expected: String,
    expected_digest: Vec<u8>,
    algorithm: DigestAlgorithm,
    encoding: Encoding,
    hasher: Hasher,
}

impl HashVerifier {
    pub fn new(expected: &str) -> Result<Self, IntegrityError> {
        let (algorithm, encoding, expected_digest) = parse_digest(expected)
            .ok_or_else(|| IntegrityError::UnsupportedDigest(expected.to_string()))?;

        Ok(Self {
            expected: expected.to_string(),
            expected_digest,
            algorithm,
            encoding,
            hasher: algorithm.hasher(),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Consume the verifier and compare the running digest
    pub fn verify(self) -> Result<(), IntegrityError> {
        let digest = self.hasher.finalize();
        if digest == self.expected_digest {
            return Ok(());
        }

        let actual = match self.encoding {
            Encoding::Hex => hex::encode(&digest),
            Encoding::Multibase(base) => encode_multibase(base, self.algorithm, &digest),
        };
        Err(IntegrityError::Mismatch {
            expected: self.expected,
            actual,
        })
    }
}

fn parse_digest(value: &str) -> Option<(DigestAlgorithm, Encoding, Vec<u8>)> {
    if value.chars().all(|c| c.is_ascii_hexdigit()) {
        let algorithm = match value.len() {
            64 => DigestAlgorithm::Sha256,
            128 => DigestAlgorithm::Sha512,
            _ => return None,
        };
        return Some((algorithm, Encoding::Hex, hex::decode(value).ok()?));
    }

    let mut chars = value.chars();
    let base = Multibase::from_prefix(chars.next()?)?;
    let bytes = base.decode(chars.as_str())?;

    let (code, rest) = read_varint(&bytes)?;
    let (len, digest) = read_varint(rest)?;
    let algorithm = DigestAlgorithm::from_multihash_code(code)?;
    if len as usize != algorithm.digest_len() || digest.len() != algorithm.digest_len() {
        return None;
    }

    Some((algorithm, Encoding::Multibase(base), digest.to_vec()))
}

/// Unsigned LEB128, as used by multihash headers
fn read_varint(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate().take(9) {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, &bytes[i + 1..]));
        }
    }
    None
}

fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encode a raw digest as a multibase multihash
fn encode_multibase(base: Multibase, algorithm: DigestAlgorithm, digest: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(digest.len() + 4);
    write_varint(algorithm.multihash_code(), &mut bytes);
    write_varint(digest.len() as u64, &mut bytes);
    bytes.extend_from_slice(digest);
    base.encode(&bytes)
}

/// Hash `data` and encode it as a multibase multihash
pub fn compute_multihash(base: Multibase, algorithm: DigestAlgorithm, data: &[u8]) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    encode_multibase(base, algorithm, &hasher.finalize())
}

/// Compute SHA-256 hash of data, hex encoded
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_sha256_incremental() {
        let expected = compute_hash(b"Hello, World!");
        let mut verifier = HashVerifier::new(&expected).unwrap();
        verifier.update(b"Hello, ");
        verifier.update(b"World!");
        assert!(verifier.verify().is_ok());
    }

    #[test]
    fn test_hex_is_case_insensitive() {
        let expected = compute_hash(b"data").to_uppercase();
        let mut verifier = HashVerifier::new(&expected).unwrap();
        verifier.update(b"data");
        assert!(verifier.verify().is_ok());
    }

    #[test]
    fn test_mismatch_reports_both_digests() {
        let expected = compute_hash(b"expected");
        let mut verifier = HashVerifier::new(&expected).unwrap();
        verifier.update(b"something else");
        match verifier.verify() {
            Err(IntegrityError::Mismatch { expected: e, actual }) => {
                assert_eq!(e, expected);
                assert_eq!(actual, compute_hash(b"something else"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_hex_sha512() {
        let expected = hex::encode(Sha512::digest(b"payload"));
        let mut verifier = HashVerifier::new(&expected).unwrap();
        assert_eq!(verifier.algorithm, DigestAlgorithm::Sha512);
        verifier.update(b"payload");
        assert!(verifier.verify().is_ok());
    }

    #[test]
    fn test_base58_blake2b_content_id() {
        // blake2b-512("hello world") as a base58btc multihash
        let expected = "zSEfXUA4eoiyhBKWFCD6XQRaPDRMi4X47tnhuvHxeRtFtcR8diZpwJhyhWByRuBY1Px1PABoffWQL2WDM5yow85QZwwGvb";
        assert_eq!(
            compute_multihash(Multibase::Base58Btc, DigestAlgorithm::Blake2b512, b"hello world"),
            expected
        );

        let mut verifier = HashVerifier::new(expected).unwrap();
        assert_eq!(verifier.algorithm, DigestAlgorithm::Blake2b512);
        verifier.update(b"hello ");
        verifier.update(b"world");
        assert!(verifier.verify().is_ok());

        let mut verifier = HashVerifier::new(expected).unwrap();
        verifier.update(b"hello there");
        match verifier.verify() {
            Err(IntegrityError::Mismatch { actual, .. }) => assert!(actual.starts_with("zSEfXU")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_base58_blake2s_and_sha256() {
        let blake2s = "z2i3XjxF9WFc8pRQFknq8tyWbaYmEjy8aR1ys73aiScSdexP1xN";
        let mut verifier = HashVerifier::new(blake2s).unwrap();
        assert_eq!(verifier.algorithm, DigestAlgorithm::Blake2s256);
        verifier.update(b"hello world");
        assert!(verifier.verify().is_ok());

        let sha256 = "zQmaozNR7DZHQK1ZcU9p7QdrshMvXqWK6gpu5rmrkPdT3L4";
        let mut verifier = HashVerifier::new(sha256).unwrap();
        assert_eq!(verifier.algorithm, DigestAlgorithm::Sha256);
        verifier.update(b"hello world");
        assert!(verifier.verify().is_ok());
    }

    #[test]
    fn test_base64_multihash() {
        let expected = "mwOQCQAIc7YeZKWzspVeDKrlBpQtKEfg0eM8UH1H5M/ZTq5+8wFoDfN2+0G4wm/M0lCxOWM3xpG4jeRHM1/z5eHy8f9A";
        let mut verifier = HashVerifier::new(expected).unwrap();
        verifier.update(b"hello world");
        assert!(verifier.verify().is_ok());

        let sha512 = compute_multihash(Multibase::Base64, DigestAlgorithm::Sha512, b"payload");
        let mut verifier = HashVerifier::new(&sha512).unwrap();
        verifier.update(b"tampered");
        assert!(verifier.verify().is_err());
    }

    #[test]
    fn test_unsupported_digests() {
        assert!(matches!(
            HashVerifier::new("abc123"),
            Err(IntegrityError::UnsupportedDigest(_))
        ));
        // Valid base58, unknown multihash code
        assert!(HashVerifier::new("zQmNotSupported").is_err());
        // Truncated blake2b-512 id
        assert!(HashVerifier::new("zSEfXUA4eoiyhBKWFCD6XQRaPDRMi4X47tnhuvHxeRtF").is_err());
        assert!(HashVerifier::new("m!!!").is_err());
        assert!(HashVerifier::new("z0OIl").is_err());
    }

    #[test]
    fn test_varint_header() {
        let mut bytes = Vec::new();
        write_varint(0xb240, &mut bytes);
        assert_eq!(bytes, vec![0xc0, 0xe4, 0x02]);
        assert_eq!(read_varint(&bytes), Some((0xb240, &[][..])));
    }
}
