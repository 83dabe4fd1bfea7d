use std::sync::Arc;

use nostr_sdk::Keys;

use crate::crypto::sha256;
use crate::stores::cashu::config::WalletConfig;
use crate::stores::cashu::types::Proof;
use crate::stores::cashu::utils::{Clock, ManualClock};
use crate::stores::cashu::wallet::{CashuWallet, WalletDeps, WalletOptions};
use crate::stores::cashu_memory_db::{MemoryBroadcastStore, MemoryLocalStore};
use crate::stores::mint_client::{MintClient, MintRegistry};
use crate::stores::signer::Nip44Cipher;

use super::FakeMint;

pub const TEST_MINT: &str = "https://mint.example.com";

const START_TIME: u64 = 1_700_000_000;

/// Random preimage and its payment hash, both hex
pub fn preimage_pair() -> (String, String) {
    let preimage: [u8; 32] = rand::random();
    (hex::encode(preimage), hex::encode(sha256(&preimage)))
}

/// A wallet wired to in-memory doubles
///
/// Wallets made with [`TestWallet::sibling`] share the mint and the clock,
/// each with its own store, local store and keys.
pub struct TestWallet {
    pub wallet: CashuWallet,
    pub store: MemoryBroadcastStore,
    pub local: MemoryLocalStore,
    pub mint: Arc<FakeMint>,
    pub clock: Arc<ManualClock>,
    pub keys: Keys,
}

impl TestWallet {
    pub async fn new(author: &str) -> Self {
        let clock = Arc::new(ManualClock::new(START_TIME));
        let mint = Arc::new(FakeMint::with_clock(TEST_MINT, clock.clone() as Arc<dyn Clock>));
        Self::build(author, mint, clock, None).await
    }

    pub async fn sibling(&self, author: &str) -> Self {
        Self::build(author, self.mint.clone(), self.clock.clone(), None).await
    }

    /// Fresh stores, same mint, given seed
    pub async fn with_mnemonic(&self, author: &str, mnemonic: &str) -> Self {
        Self::build(author, self.mint.clone(), self.clock.clone(), Some(mnemonic)).await
    }

    async fn build(
        author: &str,
        mint: Arc<FakeMint>,
        clock: Arc<ManualClock>,
        mnemonic: Option<&str>,
    ) -> Self {
        let store = MemoryBroadcastStore::new(author);
        let local = MemoryLocalStore::new();
        let keys = Keys::generate();
        let wallet = open_wallet(&store, &local, &keys, &mint, &clock, mnemonic).await;
        Self {
            wallet,
            store,
            local,
            mint,
            clock,
            keys,
        }
    }

    /// Another wallet instance over the same stores and keys
    pub async fn reopen(&self) -> CashuWallet {
        open_wallet(&self.store, &self.local, &self.keys, &self.mint, &self.clock, None).await
    }

    /// Issue proofs at the mint and publish them straight into the ledger
    pub async fn fund(&self, amounts: &[u64]) -> Vec<Proof> {
        let proofs = self.mint.issue(amounts).await;
        self.wallet
            .context()
            .ledger
            .publish_proofs(&proofs, TEST_MINT, &[])
            .await
            .expect("publish funding proofs");
        proofs
    }

    pub fn clock_now(&self) -> u64 {
        self.clock.now()
    }
}

async fn open_wallet(
    store: &MemoryBroadcastStore,
    local: &MemoryLocalStore,
    keys: &Keys,
    mint: &Arc<FakeMint>,
    clock: &Arc<ManualClock>,
    mnemonic: Option<&str>,
) -> CashuWallet {
    let mints = MintRegistry::new();
    mints.register(mint.clone() as Arc<dyn MintClient>);
    let deps = WalletDeps {
        store: Arc::new(store.clone()),
        cipher: Arc::new(Nip44Cipher::from_keys(keys.clone())),
        local: Arc::new(local.clone()),
        mints,
        clock: clock.clone() as Arc<dyn Clock>,
    };
    let options = WalletOptions {
        mint_url: TEST_MINT.to_string(),
        mnemonic: mnemonic.map(str::to_string),
    };
    CashuWallet::open(deps, options, WalletConfig::default())
        .await
        .expect("open test wallet")
}
