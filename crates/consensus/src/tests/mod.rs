//! Multi-node scenario tests
//!
//! Tests the consensus operator end to end over an in-process committee:
//! - leader round: balance throttling, broadcast reach, batch selection
//! - quorum: mixed essence hashes, single finalization
//! - state transitions: round isolation and bookkeeping continuity

pub(crate) mod harness;
mod transition_test;
