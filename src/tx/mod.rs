//! Transaction execution: fees, nonces, retries and the execution engine

pub mod engine;
pub mod fee;
pub mod nonce;
pub mod retry;
pub mod types;

pub use engine::TransactionEngine;
pub use fee::Fee;
pub use nonce::NonceManager;
pub use retry::RetryPolicy;
pub use types::*;
