/// Cryptographic primitives for credentials and request binding

pub mod vault;

pub use vault::{
    hmac_hex, random_code, random_token, secure_compare, BackupCodeMatch, CredentialVault,
};
