//! Core pipeline: plan model, interpretation, synthesis, validation and projects.

pub mod codegen;
pub mod compare;
pub mod interpreter;
pub mod parser;
pub mod predicate;
pub mod profile;
pub mod project;
pub mod rerun;
pub mod script;
pub mod sheet_io;
pub mod table;
pub mod types;
pub mod workflow;
