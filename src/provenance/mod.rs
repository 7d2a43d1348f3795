//! Provenance: BLAKE3 input hashing and the append-only event log.

pub mod eventlog;
pub mod hasher;
