//! Test doubles and fixtures
//!
//! Compiled for unit tests and, with the `test-utils` feature, for
//! downstream test suites.

mod fake_mint;
mod fixtures;

pub use fake_mint::FakeMint;
pub use fixtures::{preimage_pair, TestWallet, TEST_MINT};
