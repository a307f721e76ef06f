// aft-test-utils: harness pieces for exercising the master and child crates.
//
// - MockChild: a raw wire-level client for driving the master below the
//   agent layer (hand-rolled acks, pings, duplicates).
// - MockMaster: a scripted server for driving a real child agent.
// - TaskHost / NullHost: ProcessHost implementations for in-process tests.

mod hosts;
mod mock_child;
mod mock_master;

pub use hosts::{DeliveryRecord, NullHost, TaskHost};
pub use mock_child::MockChild;
pub use mock_master::{MockMaster, MockMasterConn};
