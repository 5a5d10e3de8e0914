//! Table kernels shared by the interpreter and the script runtime.
//!
//! Each kernel takes the current table by value and returns the next one, or
//! a plain-text cause. Callers add the step number and action.

pub mod columns;
pub mod groups;
pub mod reshape;
pub mod rows;
