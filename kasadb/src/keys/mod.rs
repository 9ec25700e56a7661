//! Data-encryption keys and the caching key manager.

mod key;
mod manager;

pub use key::{EncryptionKey, MasterKey, KEY_SIZE};
pub use manager::{KeyManager, KeyManagerConfig, KeyStats};
