//! Two-node test fixture
//!
//! Two [`CarrierNode`]s on one in-process network, each with its inbox
//! pumped by [`CarrierNode::spawn_inbox`].
//!
//! # Example
//!
//! ```no_run
//! use carrier_integration_tests::fixtures::TwoNodeFixture;
//!
//! # async fn demo() {
//! let fixture = TwoNodeFixture::new(Default::default());
//! fixture.establish_session().await;
//! // ... transfer between fixture.alice and fixture.bob ...
//! fixture.cleanup().await;
//! # }
//! ```

use crate::{events_until, next_event};
use carrier_core::{CarrierConfig, CarrierNode, Event, Inbox, MemoryTransport, PeerId};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Alice and Bob, connected through a [`MemoryTransport`]
pub struct TwoNodeFixture {
    pub alice: CarrierNode,
    pub bob: CarrierNode,
    pub alice_id: PeerId,
    pub bob_id: PeerId,
    inboxes: Option<(Inbox, Inbox)>,
    tasks: Vec<JoinHandle<()>>,
    dir: tempfile::TempDir,
}

impl TwoNodeFixture {
    /// Fixture with both inboxes already pumped
    pub fn new(config: CarrierConfig) -> Self {
        let mut fixture = Self::idle(config);
        fixture.start();
        fixture
    }

    /// Fixture whose inboxes hold frames until [`start`](Self::start)
    pub fn idle(config: CarrierConfig) -> Self {
        crate::init_tracing();
        let alice_id = PeerId::from("alice");
        let bob_id = PeerId::from("bob");

        let alice_transport = MemoryTransport::new(alice_id.clone());
        let bob_transport = alice_transport.endpoint(bob_id.clone());
        let alice_inbox = alice_transport.register(alice_id.clone());
        let bob_inbox = alice_transport.register(bob_id.clone());

        let alice = CarrierNode::new(config.clone(), Arc::new(alice_transport))
            .expect("valid alice config");
        let bob = CarrierNode::new(config, Arc::new(bob_transport)).expect("valid bob config");

        Self {
            alice,
            bob,
            alice_id,
            bob_id,
            inboxes: Some((alice_inbox, bob_inbox)),
            tasks: Vec::new(),
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    /// Start pumping both inboxes
    pub fn start(&mut self) {
        if let Some((alice_inbox, bob_inbox)) = self.inboxes.take() {
            self.tasks.push(self.alice.spawn_inbox(alice_inbox));
            self.tasks.push(self.bob.spawn_inbox(bob_inbox));
        }
    }

    /// Alice offers, Bob accepts; both event queues are drained afterwards
    pub async fn establish_session(&self) {
        self.alice
            .open_session(&self.bob_id)
            .await
            .expect("open session");
        events_until(&self.bob, |e| {
            matches!(e, Event::IncomingSessionRequest { .. })
        })
        .await;
        self.bob
            .accept_session(&self.alice_id)
            .await
            .expect("accept session");
        let ready = next_event(&self.alice).await;
        assert_eq!(
            ready,
            Event::SessionReady {
                peer_id: self.bob_id.clone()
            }
        );
        self.alice.events().drain();
        self.bob.events().drain();
    }

    /// Scratch directory for sources and destinations
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Shut both nodes down and stop the inbox tasks
    pub async fn cleanup(self) {
        self.alice.shutdown().await;
        self.bob.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}
