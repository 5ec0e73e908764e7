//! Value layer for the prism incremental table engine.
//!
//! This crate holds the pieces of the data model that carry no engine logic:
//! the [`Dtype`] system with its promotion lattice, the tagged [`Scalar`]
//! value, the row [`Op`] codes and the per-cell [`Transition`] codes that form
//! the wire contract with contexts.

mod dtype;
mod op;
mod scalar;
mod transition;

pub use dtype::Dtype;
pub use op::Op;
pub use scalar::{Date, Scalar, Time};
pub use transition::Transition;
