//! Backend identities.
//!
//! A backend is named by the SHA-256 digest of the raw Ed25519 public key in
//! the self-signed certificate it presents. The set of admitted identities is
//! loaded once at startup and never changes while the process runs.
use std::{collections::HashSet, fmt, path::Path, str::FromStr};

use eyre::{Result, WrapErr};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Object identifier of the Ed25519 public key algorithm (RFC 8410).
const ED25519_OID: &str = "1.3.101.112";
const ED25519_KEY_LEN: usize = 32;

/// Errors related to backend identities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentityError {
    /// The identity string is not valid hexadecimal
    #[error("Invalid identity hash {0:?}: not hexadecimal")]
    InvalidHex(String),

    /// The identity decodes to the wrong number of bytes
    #[error("Invalid identity hash: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The certificate could not be parsed
    #[error("Malformed certificate: {0}")]
    MalformedCertificate(String),

    /// The certificate key is not an Ed25519 key
    #[error("Certificate key type is not Ed25519 (algorithm {0})")]
    UnsupportedKeyType(String),

    /// The key hash is not in the allow-list
    #[error("Unrecognized backend {0}")]
    UnrecognizedBackend(IdentityHash),
}

/// SHA-256 digest of a backend's Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityHash([u8; 32]);

impl IdentityHash {
    pub const LEN: usize = 32;

    /// Hash a raw Ed25519 public key into its identity.
    pub fn of_public_key(raw_key: &[u8]) -> Self {
        Self(Sha256::digest(raw_key).into())
    }

    /// Derive the identity of a DER certificate, rejecting anything but Ed25519 keys.
    pub fn from_certificate(der: &[u8]) -> Result<Self, IdentityError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| IdentityError::MalformedCertificate(e.to_string()))?;
        let spki = cert.public_key();

        let algorithm = spki.algorithm.algorithm.to_id_string();
        if algorithm != ED25519_OID {
            return Err(IdentityError::UnsupportedKeyType(algorithm));
        }

        let raw_key: &[u8] = &spki.subject_public_key.data;
        if raw_key.len() != ED25519_KEY_LEN {
            return Err(IdentityError::MalformedCertificate(format!(
                "Ed25519 key is {} bytes",
                raw_key.len()
            )));
        }

        Ok(Self::of_public_key(raw_key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for IdentityHash {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidHex(s.to_string()))?;
        let actual = bytes.len();
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidLength {
            expected: Self::LEN,
            actual,
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityHash({})", self.to_hex())
    }
}

/// Immutable allow-list of backend identities.
#[derive(Debug, Clone, Default)]
pub struct AllowedSet {
    hashes: HashSet<IdentityHash>,
}

impl AllowedSet {
    pub fn new(hashes: impl IntoIterator<Item = IdentityHash>) -> Self {
        Self {
            hashes: hashes.into_iter().collect(),
        }
    }

    /// Parse an allow-list: one hex identity per line, blank lines and `#` comments ignored.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut hashes = HashSet::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let hash = line
                .parse::<IdentityHash>()
                .wrap_err_with(|| format!("Invalid backend on line {}: {line:?}", index + 1))?;
            hashes.insert(hash);
        }
        Ok(Self { hashes })
    }

    /// Load the allow-list file named in the configuration.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read backends file {}", path.display()))?;
        Self::parse(&contents)
            .wrap_err_with(|| format!("Failed to parse backends file {}", path.display()))
    }

    pub fn contains(&self, hash: &IdentityHash) -> bool {
        self.hashes.contains(hash)
    }

    /// Derive the identity of a client certificate and check it against the allow-list.
    pub fn verify(&self, certificate_der: &[u8]) -> Result<IdentityHash, IdentityError> {
        let hash = IdentityHash::from_certificate(certificate_der)?;
        if !self.contains(&hash) {
            return Err(IdentityError::UnrecognizedBackend(hash));
        }
        Ok(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}
