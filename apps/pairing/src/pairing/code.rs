use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const CODE_MIN: u32 = 100_000;
const CODE_MAX: u32 = 999_999;
const PAIRING_ID_BYTES: usize = 24;

pub const DEFAULT_DEVICE_NAME: &str = "Browser extension";
const MAX_DEVICE_NAME_CHARS: usize = 80;

/// Draws a six-digit code uniformly from 100000..=999999.
pub fn generate_code() -> String {
    OsRng.gen_range(CODE_MIN..=CODE_MAX).to_string()
}

/// Random opaque pairing id: 24 bytes from the OS CSPRNG, hex encoded.
pub fn generate_pairing_id() -> String {
    let mut bytes = [0u8; PAIRING_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Strips whitespace and `-` separators so "482 913" and "482-913" match "482913".
pub fn normalize_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect()
}

pub fn normalize_device_name(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(name) if !name.is_empty() => name.chars().take(MAX_DEVICE_NAME_CHARS).collect(),
        _ => DEFAULT_DEVICE_NAME.to_string(),
    }
}

/// Salted SHA-256 hashing for pairing codes.
#[derive(Clone)]
pub struct CodeHasher {
    salt: String,
}

impl CodeHasher {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Hash binding a code to one specific pairing.
    pub fn full_hash(&self, pairing_id: &str, code: &str) -> String {
        self.digest(&format!("{}|{}|{}", self.salt, pairing_id, code))
    }

    /// Hash of the code alone, used to find a pairing when the id is unknown.
    pub fn code_only_hash(&self, code: &str) -> String {
        self.digest(&format!("{}|code|{}", self.salt, code))
    }

    /// Constant-time check of `code` against a stored full hash.
    pub fn verify(&self, pairing_id: &str, code: &str, stored_hash: &str) -> bool {
        let expected = self.full_hash(pairing_id, code);
        expected.as_bytes().ct_eq(stored_hash.as_bytes()).into()
    }

    fn digest(&self, input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }
}
