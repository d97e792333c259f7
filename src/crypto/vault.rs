/// Credential vault: password and backup-code hashing, TOTP secret
/// encryption, keyed client hashing and constant-time comparison.
use crate::error::{HoleError, HoleResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use once_cell::sync::OnceCell;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const PASSWORD_ITERATIONS: u32 = 310_000;
const PASSWORD_SALT_LEN: usize = 32;
const DIGEST_LEN: usize = 32;

pub const BACKUP_CODE_COUNT: usize = 8;
pub const BACKUP_CODE_LEN: usize = 8;
const BACKUP_CODE_ITERATIONS: u32 = 10_000;
const BACKUP_CODE_SALT_LEN: usize = 16;
/// No 0/O or 1/I, to survive being read aloud or handwritten
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const IV_LEN: usize = 12;
const MAX_STORED_ITERATIONS: u32 = 5_000_000;

/// Well-formed hash that matches no password; verifying against it costs
/// the same as a real check.
const DUMMY_PASSWORD_HASH: &str = "310000:\
    0000000000000000000000000000000000000000000000000000000000000000:\
    0000000000000000000000000000000000000000000000000000000000000000";

/// Outcome of checking a backup code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupCodeMatch {
    pub valid: bool,
    /// Hashes still unused after this attempt
    pub remaining: Vec<String>,
}

/// Holds key material for credential operations
///
/// The AES cipher is built on first use and cached for the life of the vault.
/// Rotating the TOTP key means building a new vault; secrets encrypted under
/// the old key no longer decrypt.
pub struct CredentialVault {
    totp_key_hex: SecretString,
    ip_hash_key: SecretString,
    cipher: OnceCell<Aes256Gcm>,
}

impl CredentialVault {
    pub fn new(totp_key_hex: SecretString, ip_hash_key: SecretString) -> Self {
        Self {
            totp_key_hex,
            ip_hash_key,
            cipher: OnceCell::new(),
        }
    }

    // ========== Passwords ==========

    /// Hash a password on the blocking pool
    pub async fn hash_password(&self, plaintext: &str) -> HoleResult<String> {
        let plaintext = plaintext.to_string();
        tokio::task::spawn_blocking(move || {
            derive_stored(&plaintext, PASSWORD_ITERATIONS, PASSWORD_SALT_LEN)
        })
        .await
        .map_err(|e| HoleError::Internal(format!("Password hashing task failed: {}", e)))
    }

    /// Verify a password against its stored hash
    ///
    /// Malformed stored values verify as `false`.
    pub async fn verify_password(&self, plaintext: &str, stored: &str) -> bool {
        let plaintext = plaintext.to_string();
        let stored = stored.to_string();
        tokio::task::spawn_blocking(move || verify_stored(&plaintext, &stored))
            .await
            .unwrap_or(false)
    }

    /// Burn one full password derivation
    ///
    /// Used for unknown accounts so response timing matches a real check.
    pub async fn verify_dummy_password(&self, plaintext: &str) {
        let _ = self.verify_password(plaintext, DUMMY_PASSWORD_HASH).await;
    }

    // ========== TOTP secret envelope ==========

    fn cipher(&self) -> HoleResult<&Aes256Gcm> {
        self.cipher.get_or_try_init(|| {
            let key = hex::decode(self.totp_key_hex.expose_secret()).map_err(|_| {
                HoleError::Internal("TOTP encryption key is not valid hex".to_string())
            })?;
            if key.len() != 32 {
                return Err(HoleError::Internal(
                    "TOTP encryption key must be 32 bytes".to_string(),
                ));
            }
            Aes256Gcm::new_from_slice(&key)
                .map_err(|_| HoleError::Internal("Invalid TOTP encryption key".to_string()))
        })
    }

    /// Encrypt a TOTP secret as `ivHex:ciphertextHex`
    pub fn encrypt_totp_secret(&self, plaintext: &str) -> HoleResult<String> {
        let cipher = self.cipher()?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| HoleError::Internal("TOTP secret encryption failed".to_string()))?;

        Ok(format!("{}:{}", hex::encode(iv), hex::encode(ciphertext)))
    }

    /// Decrypt a stored TOTP secret; any tampering fails
    pub fn decrypt_totp_secret(&self, stored: &str) -> HoleResult<String> {
        let cipher = self.cipher()?;
        let malformed = || HoleError::Internal("Malformed encrypted TOTP secret".to_string());

        let (iv_hex, ct_hex) = stored.split_once(':').ok_or_else(malformed)?;
        let iv = hex::decode(iv_hex).map_err(|_| malformed())?;
        let ciphertext = hex::decode(ct_hex).map_err(|_| malformed())?;
        if iv.len() != IV_LEN {
            return Err(malformed());
        }

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map_err(|_| HoleError::Internal("TOTP secret decryption failed".to_string()))?;

        String::from_utf8(plaintext).map_err(|_| malformed())
    }

    // ========== Backup codes ==========

    /// Generate a fresh set of distinct backup codes
    pub fn generate_backup_codes() -> Vec<String> {
        let mut codes: Vec<String> = Vec::with_capacity(BACKUP_CODE_COUNT);
        while codes.len() < BACKUP_CODE_COUNT {
            let code = random_code(BACKUP_CODE_LEN);
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes
    }

    /// Hash backup codes for storage
    pub async fn hash_backup_codes(&self, codes: &[String]) -> HoleResult<Vec<String>> {
        let codes = codes.to_vec();
        tokio::task::spawn_blocking(move || {
            codes
                .iter()
                .map(|code| {
                    derive_stored(
                        &normalize_backup_code(code),
                        BACKUP_CODE_ITERATIONS,
                        BACKUP_CODE_SALT_LEN,
                    )
                })
                .collect()
        })
        .await
        .map_err(|e| HoleError::Internal(format!("Backup code hashing task failed: {}", e)))
    }

    /// Check a candidate against stored hashes
    ///
    /// On a match the matched hash is dropped from `remaining`.
    pub async fn verify_backup_code(&self, candidate: &str, hashes: &[String]) -> BackupCodeMatch {
        let candidate = normalize_backup_code(candidate);
        let hashes = hashes.to_vec();
        let fallback = hashes.clone();

        tokio::task::spawn_blocking(move || {
            match hashes.iter().position(|h| verify_stored(&candidate, h)) {
                Some(index) => {
                    let mut remaining = hashes;
                    remaining.remove(index);
                    BackupCodeMatch {
                        valid: true,
                        remaining,
                    }
                }
                None => BackupCodeMatch {
                    valid: false,
                    remaining: hashes,
                },
            }
        })
        .await
        .unwrap_or(BackupCodeMatch {
            valid: false,
            remaining: fallback,
        })
    }

    // ========== Keyed hashing ==========

    /// Keyed hash of a client address; raw addresses are never stored
    pub fn hash_ip(&self, ip: &str) -> HoleResult<String> {
        hmac_hex(self.ip_hash_key.expose_secret().as_bytes(), ip.as_bytes())
    }
}

/// HMAC-SHA-256, hex encoded
pub fn hmac_hex(key: &[u8], message: &[u8]) -> HoleResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| HoleError::Internal("Invalid HMAC key".to_string()))?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string equality
///
/// Inputs are padded to a common length before comparing, and the length
/// check is folded in afterwards so neither short-circuits.
pub fn secure_compare(a: &str, b: &str) -> bool {
    let len = a.len().max(b.len());
    let mut pa = vec![0u8; len];
    let mut pb = vec![0u8; len];
    pa[..a.len()].copy_from_slice(a.as_bytes());
    pb[..b.len()].copy_from_slice(b.as_bytes());

    let bytes_equal = pa[..].ct_eq(&pb[..]);
    let lengths_equal = (a.len() as u64).ct_eq(&(b.len() as u64));
    (bytes_equal & lengths_equal).into()
}

/// 256 random bits, hex encoded
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Code drawn uniformly from the backup-code alphabet
///
/// Bytes at or above the largest multiple of the alphabet size are discarded
/// so every symbol is equally likely.
pub fn random_code(len: usize) -> String {
    let alphabet_len = BACKUP_CODE_ALPHABET.len();
    let limit = 256 - (256 % alphabet_len);
    let mut out = String::with_capacity(len);
    let mut buf = [0u8; 16];

    while out.len() < len {
        OsRng.fill_bytes(&mut buf);
        for &byte in buf.iter() {
            if (byte as usize) < limit {
                out.push(BACKUP_CODE_ALPHABET[byte as usize % alphabet_len] as char);
                if out.len() == len {
                    break;
                }
            }
        }
    }
    out
}

fn normalize_backup_code(code: &str) -> String {
    code.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

fn derive(secret: &str, salt: &[u8], iterations: u32) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, iterations, &mut out);
    out
}

/// `iterations:saltHex:digestHex`
fn derive_stored(secret: &str, iterations: u32, salt_len: usize) -> String {
    let mut salt = vec![0u8; salt_len];
    OsRng.fill_bytes(&mut salt);
    let digest = derive(secret, &salt, iterations);
    format!("{}:{}:{}", iterations, hex::encode(salt), hex::encode(digest))
}

fn verify_stored(secret: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, ':');
    let (Some(iter_str), Some(salt_hex), Some(digest_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let Ok(iterations) = iter_str.parse::<u32>() else {
        return false;
    };
    if iterations == 0 || iterations > MAX_STORED_ITERATIONS {
        return false;
    }
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
        return false;
    };
    if expected.len() != DIGEST_LEN {
        return false;
    }

    let actual = derive(secret, &salt, iterations);
    actual[..].ct_eq(&expected[..]).into()
}
