pub mod auth;
pub mod crypto;
pub mod key;
pub mod optimizer;
pub mod persistence;
pub mod storage;

#[cfg(test)]
mod tests;

pub use auth::*;
pub use crypto::*;
pub use key::*;
pub use optimizer::*;
pub use persistence::*;
pub use storage::*;
