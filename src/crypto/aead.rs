//! ChaCha20-Poly1305 with salted subkeys.
//!
//! Stream layout: `salt` followed by chunks of
//! `[seal(len as u16 BE)][seal(payload)]`, each seal consuming one nonce.
//! Packet layout: `salt ++ seal(payload)` under a zero nonce.

use std::sync::Arc;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::kdf::{MasterKey, derive_subkey};
use super::{
    Cipher, CryptoError, Decryptor, Encryptor, MAX_CHUNK_SIZE, Method, NONCE_SIZE, SALT_SIZE,
    TAG_SIZE,
};

const LENGTH_SIZE: usize = 2;

/// `chacha20-ietf-poly1305` cipher bound to one password.
#[derive(Clone)]
pub struct AeadCipher {
    master: Arc<MasterKey>,
}

impl AeadCipher {
    pub fn new(password: &str) -> Self {
        Self {
            master: Arc::new(MasterKey::from_password(password)),
        }
    }

    fn session(&self, salt: &[u8]) -> Result<ChaCha20Poly1305, CryptoError> {
        let subkey = derive_subkey(&self.master, salt)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&subkey.0)))
    }
}

fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// 96-bit little-endian counter.
#[derive(Default)]
struct NonceCounter([u8; NONCE_SIZE]);

impl NonceCounter {
    fn next(&mut self) -> Nonce {
        let nonce = Nonce::clone_from_slice(&self.0);
        for byte in self.0.iter_mut() {
            let (value, overflow) = byte.overflowing_add(1);
            *byte = value;
            if !overflow {
                break;
            }
        }
        nonce
    }
}

struct StreamEncryptor {
    master: Arc<MasterKey>,
    cipher: Option<ChaCha20Poly1305>,
    nonce: NonceCounter,
}

impl Encryptor for StreamEncryptor {
    fn encrypt(&mut self, plain: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if plain.is_empty() {
            return Ok(());
        }
        if self.cipher.is_none() {
            let salt = random_salt();
            let subkey = derive_subkey(&self.master, &salt)?;
            out.extend_from_slice(&salt);
            self.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(&subkey.0)));
        }
        let Some(cipher) = &self.cipher else {
            return Ok(());
        };

        for chunk in plain.chunks(MAX_CHUNK_SIZE) {
            let len = (chunk.len() as u16).to_be_bytes();
            let sealed_len = cipher
                .encrypt(&self.nonce.next(), len.as_slice())
                .map_err(|_| CryptoError::Encryption)?;
            out.extend_from_slice(&sealed_len);
            let sealed = cipher
                .encrypt(&self.nonce.next(), chunk)
                .map_err(|_| CryptoError::Encryption)?;
            out.extend_from_slice(&sealed);
        }
        Ok(())
    }
}

struct StreamDecryptor {
    master: Arc<MasterKey>,
    cipher: Option<ChaCha20Poly1305>,
    nonce: NonceCounter,
    buffer: Vec<u8>,
    /// Payload length of a chunk whose length field is already opened.
    chunk_len: Option<usize>,
}

impl Decryptor for StreamDecryptor {
    fn decrypt(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        self.buffer.extend_from_slice(data);
        let mut pos = 0;

        if self.cipher.is_none() {
            if self.buffer.len() < SALT_SIZE {
                return Ok(());
            }
            let subkey = derive_subkey(&self.master, &self.buffer[..SALT_SIZE])?;
            self.cipher = Some(ChaCha20Poly1305::new(Key::from_slice(&subkey.0)));
            pos = SALT_SIZE;
        }
        let Some(cipher) = &self.cipher else {
            return Ok(());
        };

        loop {
            let len = match self.chunk_len {
                Some(len) => len,
                None => {
                    if self.buffer.len() - pos < LENGTH_SIZE + TAG_SIZE {
                        break;
                    }
                    let opened = cipher
                        .decrypt(&self.nonce.next(), &self.buffer[pos..pos + LENGTH_SIZE + TAG_SIZE])
                        .map_err(|_| CryptoError::Authentication)?;
                    pos += LENGTH_SIZE + TAG_SIZE;
                    let len = u16::from_be_bytes([opened[0], opened[1]]) as usize;
                    if len > MAX_CHUNK_SIZE {
                        return Err(CryptoError::ChunkTooLarge(len));
                    }
                    self.chunk_len = Some(len);
                    len
                }
            };
            if self.buffer.len() - pos < len + TAG_SIZE {
                break;
            }
            let opened = cipher
                .decrypt(&self.nonce.next(), &self.buffer[pos..pos + len + TAG_SIZE])
                .map_err(|_| CryptoError::Authentication)?;
            out.extend_from_slice(&opened);
            pos += len + TAG_SIZE;
            self.chunk_len = None;
        }

        self.buffer.drain(..pos);
        Ok(())
    }
}

impl Cipher for AeadCipher {
    fn method(&self) -> Method {
        Method::Chacha20IetfPoly1305
    }

    fn encryptor(&self) -> Box<dyn Encryptor> {
        Box::new(StreamEncryptor {
            master: self.master.clone(),
            cipher: None,
            nonce: NonceCounter::default(),
        })
    }

    fn decryptor(&self) -> Box<dyn Decryptor> {
        Box::new(StreamDecryptor {
            master: self.master.clone(),
            cipher: None,
            nonce: NonceCounter::default(),
            buffer: Vec::new(),
            chunk_len: None,
        })
    }

    fn encrypt_packet(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let salt = random_salt();
        let cipher = self.session(&salt)?;
        let sealed = cipher
            .encrypt(&NonceCounter::default().next(), plain)
            .map_err(|_| CryptoError::Encryption)?;
        let mut out = Vec::with_capacity(SALT_SIZE + sealed.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt_packet(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < SALT_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort);
        }
        let (salt, sealed) = data.split_at(SALT_SIZE);
        let cipher = self.session(salt)?;
        cipher
            .decrypt(&NonceCounter::default().next(), sealed)
            .map_err(|_| CryptoError::Authentication)
    }

    fn packet_overhead(&self) -> usize {
        SALT_SIZE + TAG_SIZE
    }

    fn stream_overhead(&self, len: usize) -> usize {
        let chunks = len.div_ceil(MAX_CHUNK_SIZE).max(1);
        SALT_SIZE + chunks * (LENGTH_SIZE + 2 * TAG_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(cipher: &AeadCipher, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        cipher.encryptor().encrypt(input, &mut out).unwrap();
        out
    }

    #[test]
    fn stream_decrypts_across_arbitrary_splits() {
        let cipher = AeadCipher::new("secret");
        let input: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let sealed = stream(&cipher, &input);

        let mut decryptor = cipher.decryptor();
        let mut plain = Vec::new();
        for piece in sealed.chunks(777) {
            decryptor.decrypt(piece, &mut plain).unwrap();
        }

        assert_eq!(plain, input);
        assert!(sealed.len() - input.len() <= cipher.stream_overhead(input.len()));
    }

    #[test]
    fn successive_encrypt_calls_form_one_stream() {
        let cipher = AeadCipher::new("secret");
        let mut encryptor = cipher.encryptor();
        let mut sealed = Vec::new();
        encryptor.encrypt(b"hello ", &mut sealed).unwrap();
        encryptor.encrypt(b"", &mut sealed).unwrap();
        encryptor.encrypt(b"world", &mut sealed).unwrap();

        let mut plain = Vec::new();
        cipher.decryptor().decrypt(&sealed, &mut plain).unwrap();

        assert_eq!(plain, b"hello world");
    }

    #[test]
    fn wrong_password_fails_authentication() {
        let sealed = stream(&AeadCipher::new("right"), b"payload");

        let mut plain = Vec::new();
        let err = AeadCipher::new("wrong")
            .decryptor()
            .decrypt(&sealed, &mut plain)
            .unwrap_err();

        assert_eq!(err, CryptoError::Authentication);
        assert!(plain.is_empty());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let cipher = AeadCipher::new("secret");
        let mut sealed = stream(&cipher, b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        let err = cipher.decryptor().decrypt(&sealed, &mut Vec::new()).unwrap_err();

        assert_eq!(err, CryptoError::Authentication);
    }

    #[test]
    fn packets_are_salted_and_authenticated() {
        let cipher = AeadCipher::new("secret");

        let a = cipher.encrypt_packet(b"datagram").unwrap();
        let b = cipher.encrypt_packet(b"datagram").unwrap();

        assert_ne!(a, b);
        assert_eq!(a.len(), 8 + cipher.packet_overhead());
        assert_eq!(cipher.decrypt_packet(&a).unwrap(), b"datagram");
        assert_eq!(
            AeadCipher::new("other").decrypt_packet(&a).unwrap_err(),
            CryptoError::Authentication
        );
        assert_eq!(cipher.decrypt_packet(&a[..20]).unwrap_err(), CryptoError::TooShort);
    }

    #[test]
    fn nonce_counter_carries() {
        let mut counter = NonceCounter([0xFF, 0xFF, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);

        counter.next();

        assert_eq!(counter.0[..3], [0, 0, 1]);
    }
}
