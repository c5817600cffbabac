use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL I/O error: {0}")]
    WalIo(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: data may be corrupted or tampered, or the key is wrong")]
    Decryption,

    #[error("KDF error: {0}")]
    Kdf(String),

    #[error("SQL parse error: {0}")]
    Parse(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Write conflict, transaction must retry")]
    WriteConflict,

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Page overflow: data exceeds page capacity")]
    PageOverflow,

    #[error("Page not found: page_id={0}")]
    PageNotFound(u64),

    #[error("Invalid page format")]
    InvalidPage,

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Database is in read-only mode: {0}")]
    ReadOnly(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;
