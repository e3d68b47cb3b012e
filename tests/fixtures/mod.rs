//! Test fixtures

pub mod manual_peer;
pub mod two_node;

pub use manual_peer::ManualPeer;
pub use two_node::TwoNodeFixture;
