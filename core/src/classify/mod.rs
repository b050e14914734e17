//! The hint-based classification engine.
//!
//! Detector stages register *hints* on flows; the assigner stage combines
//! the hint bitmap with the masks compiled from the metadata to assign a
//! focus per facet, possibly marking the verdict final.

pub mod assigner;
pub mod bitset;
pub mod constraints;
pub mod dispatcher;
pub mod dpi;
pub mod hints;
pub mod metadata;
pub mod port;
pub mod tags;
