#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod nat_traversal;

pub use nat_traversal::{
    NatClassification, NatTraversal, NatTraversalConfig, PeerTarget, PunchSession, PunchState,
    SessionEvent, TraversalReport,
};
