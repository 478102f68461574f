//! Internal tests module
//!
//! Multi-node cluster tests over the in-process network, with full access to
//! crate internals.

mod comprehensive;
mod test_utils;
