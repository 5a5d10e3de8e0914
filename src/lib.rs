//! Regrid: plan-driven spreadsheet normalization.
//!
//! A declarative step plan is validated, interpreted in-process for preview,
//! lowered into a standalone script, checked in a sandbox against the
//! interpreter, and persisted as a re-runnable project.

pub mod cli;
pub mod collaborator;
pub mod config;
pub mod core;
pub mod error;
pub mod provenance;
pub mod sandbox;
pub mod steps;
