//! API keys for the public leads API
//!
//! Keys are shown once at creation; only their HMAC-SHA256 hash is stored.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_PREFIX: &str = "sm_live_";
const KEY_BYTES: usize = 24;

#[derive(Clone)]
pub struct ApiKeyManager {
    hmac_secret: Vec<u8>,
}

impl ApiKeyManager {
    pub fn new(hmac_secret: &str) -> Self {
        Self {
            hmac_secret: hmac_secret.as_bytes().to_vec(),
        }
    }

    /// New random key with the `sm_live_` prefix
    pub fn generate_key(&self) -> String {
        let mut bytes = [0u8; KEY_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        format!("{}{}", API_KEY_PREFIX, hex::encode(bytes))
    }

    /// Cheap shape check before touching the database
    pub fn is_well_formed(&self, key: &str) -> bool {
        key.strip_prefix(API_KEY_PREFIX)
            .map(|rest| rest.len() == KEY_BYTES * 2 && rest.bytes().all(|b| b.is_ascii_hexdigit()))
            .unwrap_or(false)
    }

    pub fn hash_key(&self, key: &str) -> String {
        // HMAC accepts keys of any length
        let mut mac = match HmacSha256::new_from_slice(&self.hmac_secret) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// First characters of a key, safe to log and display
    pub fn display_prefix(key: &str) -> &str {
        let end = key
            .char_indices()
            .nth(API_KEY_PREFIX.len() + 4)
            .map(|(i, _)| i)
            .unwrap_or(key.len());
        &key[..end]
    }
}
