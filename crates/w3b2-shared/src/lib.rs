pub mod constants;
pub mod crypto;
pub mod error;
pub mod events;
pub mod identity;
pub mod protocol;
pub mod types;
