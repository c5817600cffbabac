pub mod aead;
pub mod buffered;
pub mod cipher;
pub mod kdf;

pub use aead::{MasterKey, RecordCrypto, AEAD_OVERHEAD, NONCE_SIZE, TAG_SIZE};
pub use buffered::BufferedEncryptor;
pub use cipher::Cipher;
