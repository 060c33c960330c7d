//! Transaction construction
//!
//! Local signing and nonce management for operations submitted through
//! verifiers. Validators only ever see fully signed artifacts; no key
//! material leaves this process.

pub mod nonce;
pub mod signer;

pub use nonce::{NonceAllocator, TransactionCountSource, VerifierCountSource};
pub use signer::{EthereumSigner, FabricProposalSigner, RawTxParams, SignedProposal, SignedTx};
