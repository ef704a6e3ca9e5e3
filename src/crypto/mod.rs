//! Cipher capability used by the relays.
//!
//! The relays only see [`Cipher`]: stream halves for TCP, one-shot packet
//! sealing for UDP, and the framing overhead of each. Two methods ship:
//! - `none`: identity, no overhead
//! - `chacha20-ietf-poly1305`: salted AEAD chunks
//!
//! Secret key material is zeroized on drop.

mod aead;
mod kdf;

pub use aead::AeadCipher;
pub use kdf::{MasterKey, SubKey, derive_subkey, evp_bytes_to_key};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of the per-stream / per-packet salt in bytes
pub const SALT_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Largest payload carried by one stream chunk
pub const MAX_CHUNK_SIZE: usize = 0x3FFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Tag mismatch: wrong password or tampered data.
    #[error("authentication failed")]
    Authentication,

    #[error("ciphertext too short")]
    TooShort,

    #[error("chunk length {0} exceeds limit")]
    ChunkTooLarge(usize),

    #[error("encryption failed")]
    Encryption,
}

/// Encrypting half of a stream. Output of successive calls concatenates.
pub trait Encryptor: Send {
    fn encrypt(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError>;
}

/// Decrypting half of a stream. Accepts arbitrary splits of the input and
/// appends whatever plaintext is complete.
pub trait Decryptor: Send {
    fn decrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError>;
}

/// Opaque encrypt/decrypt capability with a known overhead.
pub trait Cipher: Send + Sync {
    fn method(&self) -> Method;

    fn encryptor(&self) -> Box<dyn Encryptor>;

    fn decryptor(&self) -> Box<dyn Decryptor>;

    fn encrypt_packet(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt_packet(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Bytes added to every datagram.
    fn packet_overhead(&self) -> usize;

    /// Upper bound of bytes added when `len` plaintext bytes go through a
    /// fresh encryptor.
    fn stream_overhead(&self, len: usize) -> usize;
}

/// Supported cipher methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Method {
    None,
    #[default]
    Chacha20IetfPoly1305,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::None => "none",
            Method::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
        }
    }

    /// Whether the method needs a password.
    pub fn is_encrypting(self) -> bool {
        self != Method::None
    }

    pub fn cipher(self, password: &str) -> Box<dyn Cipher> {
        match self {
            Method::None => Box::new(Plain),
            Method::Chacha20IetfPoly1305 => Box::new(AeadCipher::new(password)),
        }
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Method::None),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(Method::Chacha20IetfPoly1305),
            other => Err(format!("unsupported cipher method {other:?}")),
        }
    }
}

impl TryFrom<String> for Method {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Method> for String {
    fn from(method: Method) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity cipher.
#[derive(Debug, Default, Clone, Copy)]
pub struct Plain;

struct PlainStream;

impl Encryptor for PlainStream {
    fn encrypt(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.extend_from_slice(plain);
        Ok(())
    }
}

impl Decryptor for PlainStream {
    fn decrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.extend_from_slice(data);
        Ok(())
    }
}

impl Cipher for Plain {
    fn method(&self) -> Method {
        Method::None
    }

    fn encryptor(&self) -> Box<dyn Encryptor> {
        Box::new(PlainStream)
    }

    fn decryptor(&self) -> Box<dyn Decryptor> {
        Box::new(PlainStream)
    }

    fn encrypt_packet(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(plain.to_vec())
    }

    fn decrypt_packet(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(data.to_vec())
    }

    fn packet_overhead(&self) -> usize {
        0
    }

    fn stream_overhead(&self, _len: usize) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_parse_and_display() {
        assert_eq!("none".parse::<Method>().unwrap(), Method::None);
        assert_eq!(
            "CHACHA20-IETF-POLY1305".parse::<Method>().unwrap(),
            Method::Chacha20IetfPoly1305
        );
        assert!("rc4-md5".parse::<Method>().is_err());
        assert_eq!(Method::Chacha20IetfPoly1305.to_string(), "chacha20-ietf-poly1305");
    }

    #[test]
    fn method_deserializes_from_json_string() {
        let method: Method = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(method, Method::None);
        assert!(serde_json::from_str::<Method>("\"aes-999\"").is_err());
    }

    #[test]
    fn legacy_names_do_not_fall_back_to_plaintext() {
        for name in ["table", "plain", "TABLE"] {
            let err = name.parse::<Method>().unwrap_err();
            assert!(err.contains("unsupported cipher method"), "{name}: {err}");
        }
        assert!(serde_json::from_str::<Method>("\"table\"").is_err());
    }

    #[test]
    fn plain_cipher_is_identity() {
        let cipher = Method::None.cipher("");
        let mut out = Vec::new();

        cipher.encryptor().encrypt(b"hello", &mut out).unwrap();

        assert_eq!(out, b"hello");
        assert_eq!(cipher.decrypt_packet(b"dgram").unwrap(), b"dgram");
        assert_eq!(cipher.packet_overhead(), 0);
        assert_eq!(cipher.stream_overhead(1000), 0);
    }
}
