//! Test utilities: in-memory stores and scriptable chain/signing mocks.

pub mod mocks;

pub use mocks::{
    MockBroadcaster, MockConfig, MockHistoryStore, MockSigner, MockTransferStore,
    MockWalletStore,
};
