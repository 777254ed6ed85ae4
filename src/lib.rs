//! # BART Bridge Library
//!
//! In-memory bridge between a streaming MRI reconstruction pipeline and the BART array
//! engine. Pipeline arrays are registered by name, a user-authored command script runs
//! against those names, and the engine's result comes back in the pipeline's 7-axis
//! layout. Nothing touches the filesystem on the data path.
//!
//! ## Crate Structure
//!
//! - **`registry`**: named complex-float buffers with their release strategy
//!   (C allocator, Rust allocator, or borrowed).
//! - **`remap`**: conversion between the pipeline's `[RO, E1, E2, CHA, N, S, LOC]` axes
//!   and the engine's 16-axis layout, and frame splitting of multi-map results.
//! - **`script`**: command script parsing, `$parameter` substitution, tokenization.
//! - **`orchestrator`**: fail-fast script execution and the complete reconstruction stage.
//! - **`workspace`**: per-invocation scratch directory, optionally on tmpfs.
//! - **`engine`**: the engine calling contract, a mock engine, and the BART FFI engine
//!   (feature `bart_ffi`).
//! - **`cfl`**: reading and writing `.hdr`/`.cfl` file pairs.
//! - **`config`**, **`logging`**, **`error`**: configuration, tracing setup and the
//!   crate error type.

pub mod cfl;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod registry;
pub mod remap;
pub mod script;
pub mod workspace;

pub use error::{BridgeError, BridgeResult};
pub use orchestrator::{ReconStage, StageInput, StageOutput};
