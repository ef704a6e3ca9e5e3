//! Key derivation.
//!
//! The master key is stretched from the password with MD5 (OpenSSL's
//! `EVP_BytesToKey` without salt); every stream and datagram then derives its
//! own subkey with HKDF-SHA1 over a random salt.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, KEY_SIZE};

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Password-derived key shared by every session.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn from_password(password: &str) -> Self {
        let mut key = [0u8; KEY_SIZE];
        evp_bytes_to_key(password.as_bytes(), &mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Fill `key` with `MD5(prev || password)` blocks.
pub fn evp_bytes_to_key(password: &[u8], key: &mut [u8]) {
    let mut prev: Vec<u8> = Vec::new();
    let mut filled = 0;
    while filled < key.len() {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        let block = hasher.finalize();
        let n = (key.len() - filled).min(block.len());
        key[filled..filled + n].copy_from_slice(&block[..n]);
        filled += n;
        prev.clear();
        prev.extend_from_slice(&block);
    }
    prev.zeroize();
}

/// Per-salt session key.
pub fn derive_subkey(master: &MasterKey, salt: &[u8]) -> Result<SubKey, CryptoError> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master.as_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|_| CryptoError::Encryption)?;
    Ok(SubKey(okm))
}

#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SubKey(pub(crate) [u8; KEY_SIZE]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_key_matches_openssl() {
        // openssl enc -md md5 -nosalt -k foobar -P -aes-256-cfb
        let key = MasterKey::from_password("foobar");

        assert_eq!(
            key.as_bytes()[..16],
            [
                0x38, 0x58, 0xf6, 0x22, 0x30, 0xac, 0x3c, 0x91, 0x5f, 0x30, 0x0c, 0x66, 0x43,
                0x12, 0xc6, 0x3f
            ]
        );
    }

    #[test]
    fn subkeys_differ_per_salt() {
        let master = MasterKey::from_password("secret");

        let a = derive_subkey(&master, &[1u8; 32]).unwrap();
        let b = derive_subkey(&master, &[2u8; 32]).unwrap();
        let a2 = derive_subkey(&master, &[1u8; 32]).unwrap();

        assert_ne!(a.0, b.0);
        assert_eq!(a.0, a2.0);
    }
}
