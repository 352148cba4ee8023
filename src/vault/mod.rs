//! Secret vault: dotenv codec, hybrid cipher, key material, trust,
//! plaintext guard, run injection, and the operations behind the CLI.

pub mod cipher;
pub mod dotenv;
pub mod filter;
pub mod guard;
pub mod keys;
pub mod ops;
pub mod run;
pub mod target;
pub mod trust;
