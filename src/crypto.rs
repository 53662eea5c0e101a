use std::path::Path;

use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::AeadCore;
use aes_gcm::aes::Aes192;
use aes_gcm::{AeadInPlace, Aes128Gcm, Aes256Gcm, AesGcm, KeyInit};
use base64ct::{Base64, Encoding};
use thiserror::Error;
use tracing::debug;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// The trailing bytes of an encrypted payload hold the GCM authentication tag.
pub const TAG_LENGTH: usize = 16;

/// AES-GCM nonce size. Matches the Web Crypto default used by uploaders.
pub const NONCE_LENGTH: usize = 12;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("field `{0}` is not valid base64")]
    InvalidBase64(&'static str),

    #[error("key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("nonce must be {NONCE_LENGTH} bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("payload of {0} bytes is too short to carry an authentication tag")]
    TruncatedPayload(usize),

    #[error("authentication failed, wrong key or tampered payload")]
    AuthenticationFailed,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens an encrypted payload laid out as `ciphertext || tag`, where the tag
/// is the trailing [`TAG_LENGTH`] bytes. Key and nonce arrive base64-encoded.
/// On success the buffer is truncated to the plaintext.
pub fn decrypt_payload(
    buffer: &mut Vec<u8>,
    key_b64: &str,
    nonce_b64: &str,
) -> Result<(), DecryptError> {
    let key =
        Base64::decode_vec(key_b64).map_err(|_| DecryptError::InvalidBase64("decryptionKey"))?;
    let nonce = Base64::decode_vec(nonce_b64).map_err(|_| DecryptError::InvalidBase64("iv"))?;

    if nonce.len() != NONCE_LENGTH {
        return Err(DecryptError::InvalidNonceLength(nonce.len()));
    }
    if buffer.len() < TAG_LENGTH {
        return Err(DecryptError::TruncatedPayload(buffer.len()));
    }

    let tag = buffer.split_off(buffer.len() - TAG_LENGTH);
    match key.len() {
        16 => open::<Aes128Gcm>(&key, &nonce, buffer, &tag),
        24 => open::<Aes192Gcm>(&key, &nonce, buffer, &tag),
        32 => open::<Aes256Gcm>(&key, &nonce, buffer, &tag),
        other => Err(DecryptError::InvalidKeyLength(other)),
    }
}

/// Decrypts a fetched scratch file in place: the ciphertext is read back,
/// opened and the plaintext written over the same path.
pub async fn decrypt_file_in_place(
    path: &Path,
    key_b64: &str,
    nonce_b64: &str,
) -> Result<(), DecryptError> {
    let mut data = tokio::fs::read(path).await?;
    let ciphertext_len = data.len();
    decrypt_payload(&mut data, key_b64, nonce_b64)?;
    debug!(ciphertext_len, plaintext_len = data.len(), "payload decrypted");
    tokio::fs::write(path, &data).await?;
    Ok(())
}

fn open<C>(
    key: &[u8],
    nonce: &[u8],
    buffer: &mut Vec<u8>,
    tag: &[u8],
) -> Result<(), DecryptError>
where
    C: KeyInit + AeadInPlace + AeadCore<NonceSize = U12, TagSize = U16>,
{
    let cipher = C::new_from_slice(key).map_err(|_| DecryptError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| DecryptError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use aes_gcm::aead::Aead;
    use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit, Nonce};

    use super::*;

    const KEY_256: [u8; 32] = [7u8; 32];
    const KEY_128: [u8; 16] = [9u8; 16];
    const NONCE: [u8; 12] = [3u8; 12];
    const PLAINTEXT: &[u8] = b"spoken word audio bytes";

    fn seal_256(plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm::new_from_slice(&KEY_256).unwrap();
        // The aead `encrypt` appends the tag, producing the wire layout.
        cipher.encrypt(Nonce::from_slice(&NONCE), plaintext).unwrap()
    }

    fn b64(bytes: &[u8]) -> String {
        Base64::encode_string(bytes)
    }

    #[test]
    fn round_trip_aes256() {
        let mut buffer = seal_256(PLAINTEXT);
        decrypt_payload(&mut buffer, &b64(&KEY_256), &b64(&NONCE)).unwrap();
        assert_eq!(buffer, PLAINTEXT);
    }

    #[test]
    fn round_trip_aes128() {
        let cipher = Aes128Gcm::new_from_slice(&KEY_128).unwrap();
        let mut buffer = cipher.encrypt(Nonce::from_slice(&NONCE), PLAINTEXT).unwrap();
        decrypt_payload(&mut buffer, &b64(&KEY_128), &b64(&NONCE)).unwrap();
        assert_eq!(buffer, PLAINTEXT);
    }

    #[test]
    fn tampered_tag_fails_authentication() {
        let mut buffer = seal_256(PLAINTEXT);
        let last = buffer.len() - 1;
        buffer[last] ^= 0x01;
        let err = decrypt_payload(&mut buffer, &b64(&KEY_256), &b64(&NONCE)).unwrap_err();
        assert!(matches!(err, DecryptError::AuthenticationFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let mut buffer = seal_256(PLAINTEXT);
        buffer[0] ^= 0x80;
        let err = decrypt_payload(&mut buffer, &b64(&KEY_256), &b64(&NONCE)).unwrap_err();
        assert!(matches!(err, DecryptError::AuthenticationFailed));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let mut buffer = seal_256(PLAINTEXT);
        let err = decrypt_payload(&mut buffer, &b64(&[8u8; 32]), &b64(&NONCE)).unwrap_err();
        assert!(matches!(err, DecryptError::AuthenticationFailed));
    }

    #[test]
    fn rejects_odd_key_length() {
        let mut buffer = seal_256(PLAINTEXT);
        let err = decrypt_payload(&mut buffer, &b64(&[0u8; 15]), &b64(&NONCE)).unwrap_err();
        assert!(matches!(err, DecryptError::InvalidKeyLength(15)));
    }

    #[test]
    fn rejects_odd_nonce_length() {
        let mut buffer = seal_256(PLAINTEXT);
        let err = decrypt_payload(&mut buffer, &b64(&KEY_256), &b64(&[0u8; 16])).unwrap_err();
        assert!(matches!(err, DecryptError::InvalidNonceLength(16)));
    }

    #[test]
    fn rejects_payload_shorter_than_tag() {
        let mut buffer = vec![0u8; TAG_LENGTH - 1];
        let err = decrypt_payload(&mut buffer, &b64(&KEY_256), &b64(&NONCE)).unwrap_err();
        assert!(matches!(err, DecryptError::TruncatedPayload(15)));
    }

    #[test]
    fn rejects_bad_base64() {
        let mut buffer = seal_256(PLAINTEXT);
        let err = decrypt_payload(&mut buffer, "not base64!!", &b64(&NONCE)).unwrap_err();
        assert!(matches!(err, DecryptError::InvalidBase64("decryptionKey")));
    }

    #[tokio::test]
    async fn decrypts_file_in_place() {
        let file = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(file.path(), seal_256(PLAINTEXT)).await.unwrap();
        decrypt_file_in_place(file.path(), &b64(&KEY_256), &b64(&NONCE))
            .await
            .unwrap();
        let plaintext = tokio::fs::read(file.path()).await.unwrap();
        assert_eq!(plaintext, PLAINTEXT);
    }
}
