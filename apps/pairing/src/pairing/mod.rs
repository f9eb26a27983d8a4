// Extension device pairing: short-lived six-digit codes exchanged for a
// scoped `application_import` bearer token.
// Every state change is a single conditional write in the store.

pub mod code;
pub mod memory;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod token;

pub use code::CodeHasher;
pub use memory::InMemoryPairingStore;
pub use service::{CompletedPairing, PairingService, PairingStatus, StartedPairing};
pub use store::{PairingStore, PgPairingStore};
pub use token::TokenSigner;
