//! artigraph-lib: Core types and logic for artigraph
//!
//! This crate provides the incremental build engine behind `arti`:
//! - `Artifact` / `Producer`: datasets and the versioned computations that produce them
//! - `Graph`: the sealed, validated dependency graph
//! - `plan`: per-partition staleness verdicts from fingerprints and the ledger
//! - `execute`: concurrent execution of stale units with failure isolation
//! - `Ledger`: the persisted record of what each partition was built from

pub mod artifact;
pub mod definition;
pub mod descriptor;
pub mod execute;
pub mod fingerprint;
pub mod graph;
pub mod ledger;
pub mod partition;
pub mod plan;
pub mod producer;
pub mod resource;
pub mod seed;
pub mod version;
pub mod view;
