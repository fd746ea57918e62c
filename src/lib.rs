//! # Stake-Ledger
//!
//! Validation and chain selection core of a hybrid proof-of-work /
//! proof-of-stake ledger.
//!
//! The crate decides, bit for bit like every other node, whether a
//! transaction or block is valid and which branch of the block tree is the
//! best chain. Networking, persistence engines and wallets are collaborators
//! behind narrow interfaces: [`storage::ChainStore`] for blocks and the
//! transaction index, [`wallet::WalletListener`] for notifications, and peer
//! ids plus [`node::ProcessOutcome`] towards the network.
//!
//! ## Architecture
//!
//! Leaf first:
//! - `types`, `serialize`, `constants`, `config`, `error`: data model, wire
//!   encoding, protocol constants, chain parameters, error taxonomy
//! - `script`, `standard`: script interpreter and template solver
//! - `pow`, `kernel`, `reward`: targets and trust, the stake kernel and
//!   modifier chain, minting
//! - `checkpoints`, `storage`, `chain_index`: pins, the store contract, the
//!   block tree
//! - `transaction`, `block`: context-free checks and input connection
//! - `chainstate`, `reorganization`: block acceptance and best chain switching
//! - `mempool`, `orphan`, `wallet`, `dos`, `node`: the pool, orphan buffers,
//!   notifications, misbehavior accounting and the context object
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use stake_ledger::{ChainParams, LedgerNode, ManualClock, MemoryStore};
//!
//! let params = ChainParams::regtest();
//! let clock = Arc::new(ManualClock::new(params.genesis_time as i64));
//! let node = LedgerNode::new(params, Box::new(MemoryStore::new()), clock).unwrap();
//! assert_eq!(node.best_height(), 0);
//! ```

pub mod types;
pub mod serialize;
pub mod constants;
pub mod config;
pub mod error;
pub mod script;
pub mod standard;
pub mod pow;
pub mod kernel;
pub mod reward;
pub mod checkpoints;
pub mod storage;
pub mod chain_index;
pub mod transaction;
pub mod block;
pub mod chainstate;
pub mod reorganization;
pub mod mempool;
pub mod orphan;
pub mod wallet;
pub mod dos;
pub mod node;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use config::ChainParams;
pub use error::{ConsensusError, ErrorKind, Result};
pub use chainstate::{genesis_block, ChainState};
pub use reorganization::ChainUpdate;
pub use mempool::Mempool;
pub use storage::{ChainStore, MemoryStore, TxIndex, UtxoView, WriteBatch};
pub use node::{Clock, LedgerNode, ManualClock, ProcessOutcome, SystemClock};
pub use wallet::WalletListener;
