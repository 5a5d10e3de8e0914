//! Provenance: BLAKE3 identities and the per-project JSONL event log.

pub mod eventlog;
pub mod hasher;
