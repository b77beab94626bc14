//! Authentication module
//!
//! Credential storage, JWT expiry decoding, the token lifecycle (proactive
//! and reactive renewal) and OTP login.

pub mod lifecycle;
pub mod login;
pub mod navigator;
pub mod store;
pub mod token;

pub use lifecycle::TokenLifecycle;
pub use navigator::{ConsoleNavigator, Navigator};
pub use store::{CredentialStore, FileStore, MemoryStore};
pub use token::TokenPair;
