//! Node engine for a permissioned network coordinating private
//! transactions whose state lives off-chain, with settlement anchored on
//! an EVM-compatible base ledger.
//!
//! The `dispatcher` routes submissions to one `sequencer` per contract
//! address, which drives each transaction through verifier resolution,
//! assembly against a scoped state `context`, distributed endorsement
//! gathering over the `transport`, preparation, and dispatch. The `pubtm`
//! module owns everything on the public side: gapless per-signer nonce
//! allocation and the orchestrator loops that submit and track base-ledger
//! transactions. `contention` breaks coordinator ties deterministically.
//!
//! Applications depend on [`config::NodeConfig`] to bootstrap a node,
//! [`node::Node`] and [`node::NodeHandle`] to operate it, and [`api`] for
//! the JSON-RPC surface.

pub mod abi;
pub mod api;
pub mod config;
pub mod contention;
pub mod context;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod ethclient;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod pubtm;
pub mod sequencer;
pub mod storage;
pub mod testbed;
pub mod transport;
pub mod types;
