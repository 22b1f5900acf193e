//! Shared types and validation rules for the catapult workspace.

pub mod error;
pub mod naming;
pub mod types;
