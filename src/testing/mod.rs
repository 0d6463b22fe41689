//! Testing utilities and end-to-end scenario tests.
//!
//! [`TestHarness`] wires a full in-process distributor (memory KV
//! backend, store, elector, reconcilers, handlers) so scenario tests
//! exercise the real components end to end rather than mocks. The
//! scenario tests live in the sibling modules.

mod utils;

#[cfg(test)]
mod lifecycle_tests;
#[cfg(test)]
mod rpc_tests;
#[cfg(test)]
mod subscription_tests;

pub use utils::{wait_for, RecordingTransport, StaticPeer, TestHarness};
