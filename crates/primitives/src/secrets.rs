use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use rand::RngCore;

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

const IV_LENGTH: usize = 16;

/// Encrypt a secret with AES-256-CFB. The key is the 32-byte scalar of a
/// hex-encoded private key; the random IV is prepended to the ciphertext
/// and the whole payload is hex-encoded.
pub fn encrypt(secret: &str, key: &str) -> eyre::Result<String> {
    let key_bytes = key_material(key)?;

    let mut iv = [0u8; IV_LENGTH];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut buf = secret.as_bytes().to_vec();
    Aes256CfbEnc::new(&key_bytes.into(), &iv.into()).encrypt(&mut buf);

    let mut out = iv.to_vec();
    out.extend_from_slice(&buf);
    Ok(hex::encode(out))
}

/// Decrypt a payload produced by [`encrypt`].
pub fn decrypt(encrypted: &str, key: &str) -> eyre::Result<String> {
    let key_bytes = key_material(key)?;

    let payload = hex::decode(encrypted)?;
    if payload.len() < IV_LENGTH {
        eyre::bail!("ciphertext too short");
    }

    let (iv, ciphertext) = payload.split_at(IV_LENGTH);
    let mut iv_bytes = [0u8; IV_LENGTH];
    iv_bytes.copy_from_slice(iv);

    let mut buf = ciphertext.to_vec();
    Aes256CfbDec::new(&key_bytes.into(), &iv_bytes.into()).decrypt(&mut buf);

    Ok(String::from_utf8(buf)?)
}

fn key_material(key: &str) -> eyre::Result<[u8; 32]> {
    let bytes = hex::decode(key.trim_start_matches("0x"))?;
    bytes
        .try_into()
        .map_err(|_| eyre::eyre!("encryption key must be a 32-byte hex scalar"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn encrypt_decrypt_round_trips() {
        let secret = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

        let encrypted = encrypt(secret, KEY).unwrap();
        assert_ne!(encrypted, secret);

        assert_eq!(decrypt(&encrypted, KEY).unwrap(), secret);
    }

    #[test]
    fn each_encryption_uses_a_fresh_iv() {
        let a = encrypt("secret", KEY).unwrap();
        let b = encrypt("secret", KEY).unwrap();

        assert_ne!(a, b);
        assert_eq!(decrypt(&a, KEY).unwrap(), decrypt(&b, KEY).unwrap());
    }

    #[test]
    fn rejects_wrong_key_material() {
        assert!(encrypt("secret", "deadbeef").is_err());
        assert!(decrypt("00", KEY).is_err());
    }
}
