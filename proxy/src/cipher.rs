//! Credential obfuscation for `auth_secure` deployments.
//!
//! Stored proxy credentials are AES-128-CBC encrypted and base64 encoded;
//! inbound credentials are passed through [`encrypt`] before comparison so
//! plaintext never has to live in the config file.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

// Fixed key material: this is obfuscation against config-file leaks, not a
// secrecy boundary. Changing it invalidates every stored credential.
const KEY: &[u8; 16] = b"influxdb-proxy@k";
const IV: &[u8; 16] = b"influxdb-proxy@v";

/// Encrypt `text` to the transportable base64 form.
pub fn encrypt(text: &str) -> String {
    let ct = Aes128CbcEnc::new(KEY.into(), IV.into())
        .encrypt_padded_vec_mut::<Pkcs7>(text.as_bytes());
    BASE64.encode(ct)
}

/// Invert [`encrypt`]. `None` when the input is not a valid ciphertext.
pub fn decrypt(text: &str) -> Option<String> {
    let ct = BASE64.decode(text).ok()?;
    let pt = Aes128CbcDec::new(KEY.into(), IV.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .ok()?;
    String::from_utf8(pt).ok()
}
