//! Property-based tests for the transfer registry and engine.

use carrier_core::{
    CarrierError, Direction, FileId, PeerId, TransferDescriptor, TransferRegistry, TransferState,
};
use proptest::prelude::*;

fn any_state() -> impl Strategy<Value = TransferState> {
    prop_oneof![
        Just(TransferState::Queried),
        Just(TransferState::Requested),
        Just(TransferState::Accepted),
        Just(TransferState::Transferring),
        Just(TransferState::Paused),
        Just(TransferState::Completed),
        Just(TransferState::Rejected),
        Just(TransferState::Canceled),
        Just(TransferState::Aborted),
    ]
}

fn transferring(registry: &TransferRegistry, total: u64) -> FileId {
    let file_id = FileId::new("f");
    registry
        .register(TransferDescriptor::requested(
            file_id.clone(),
            PeerId::from("peer"),
            "file.bin",
            total,
            Direction::Receive,
        ))
        .unwrap();
    registry
        .transition(&file_id, TransferState::Accepted)
        .unwrap();
    registry
        .transition(&file_id, TransferState::Transferring)
        .unwrap();
    file_id
}

// ============================================================================
// Registry properties
// ============================================================================

mod registry_props {
    use super::*;

    proptest! {
        /// Recorded progress never decreases and never exceeds the total
        #[test]
        fn progress_is_monotonic(
            total in 1u64..10_000,
            steps in prop::collection::vec(0u64..12_000, 1..50)
        ) {
            let registry = TransferRegistry::new(16);
            let file_id = transferring(&registry, total);
            let mut last = 0;

            for step in steps {
                let accepted = registry.lock().record_progress(&file_id, step).is_ok();
                prop_assert_eq!(accepted, step >= last && step < total);
                if accepted {
                    last = step;
                }
                let descriptor = registry.lookup(&file_id).unwrap();
                prop_assert_eq!(descriptor.transferred_bytes, last);
                prop_assert!(descriptor.transferred_bytes <= total);
            }

            let done = registry.lock().complete(&file_id).unwrap();
            prop_assert_eq!(done.transferred_bytes, total);
        }

        /// Only defined transitions succeed, and terminal states absorb
        #[test]
        fn transitions_follow_state_machine(
            targets in prop::collection::vec(any_state(), 1..30)
        ) {
            let registry = TransferRegistry::new(16);
            let file_id = FileId::new("q");
            registry
                .register(TransferDescriptor::queried(
                    file_id.clone(),
                    PeerId::from("peer"),
                    "file.bin",
                    Direction::Send,
                ))
                .unwrap();
            let mut state = TransferState::Queried;

            for target in targets {
                match registry.transition(&file_id, target) {
                    Ok(descriptor) => {
                        prop_assert!(state.can_transition(target));
                        prop_assert_eq!(descriptor.state, target);
                        state = target;
                    }
                    Err(err) => {
                        prop_assert!(!state.can_transition(target));
                        prop_assert_eq!(
                            err,
                            CarrierError::InvalidTransition {
                                file_id: file_id.clone(),
                                from: state,
                                to: target,
                            }
                        );
                    }
                }
                prop_assert_eq!(registry.lookup(&file_id).unwrap().state, state);
                prop_assert_eq!(registry.active_count(), usize::from(!state.is_terminal()));
            }
        }

        /// At most one live send-side transfer per peer and file name
        #[test]
        fn send_names_are_unique_per_peer(
            ops in prop::collection::vec((0usize..3, 0usize..3, any::<bool>()), 1..40)
        ) {
            let registry = TransferRegistry::new(64);
            let mut live: Vec<(usize, usize, FileId)> = Vec::new();

            for (n, (peer, name, finish)) in ops.into_iter().enumerate() {
                let file_id = FileId::new(format!("id-{n}"));
                let result = registry.register(TransferDescriptor::requested(
                    file_id.clone(),
                    PeerId::new(format!("peer-{peer}")),
                    format!("name-{name}"),
                    10,
                    Direction::Send,
                ));
                let clash = live.iter().any(|(p, f, _)| *p == peer && *f == name);

                match result {
                    Ok(_) => {
                        prop_assert!(!clash);
                        live.push((peer, name, file_id));
                    }
                    Err(err) => {
                        prop_assert!(clash);
                        let is_duplicate = matches!(err, CarrierError::DuplicateTransfer { .. });
                        prop_assert!(is_duplicate);
                    }
                }

                if finish {
                    if let Some(pos) = live.iter().position(|(p, _, _)| *p == peer) {
                        let (_, _, id) = live.remove(pos);
                        registry.transition(&id, TransferState::Canceled).unwrap();
                    }
                }
                prop_assert_eq!(registry.active_count(), live.len());
            }
        }
    }
}

// ============================================================================
// Engine properties
// ============================================================================

mod engine_props {
    use super::*;
    use carrier_core::{CarrierConfig, Event};
    use carrier_integration_tests::fixtures::ManualPeer;
    use carrier_integration_tests::pattern;

    /// Split `len` bytes at the given fractions into contiguous chunks
    fn chunk_bounds(len: usize, cuts: &[usize]) -> Vec<(usize, usize)> {
        let mut points: Vec<usize> = cuts.iter().map(|c| c % len).filter(|c| *c > 0).collect();
        points.push(0);
        points.push(len);
        points.sort_unstable();
        points.dedup();
        points.windows(2).map(|w| (w[0], w[1] - w[0])).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Any contiguous chunking of the content completes with the full size
        #[test]
        fn any_chunking_completes(
            len in 1usize..2048,
            cuts in prop::collection::vec(any::<usize>(), 0..40)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (last, written, data) = runtime.block_on(async {
                let mut peer = ManualPeer::new(CarrierConfig::default()).await;
                let data = pattern(len);
                let (file_id, path) = peer.offer_accepted("prop.bin", &data).await;

                for (offset, size) in chunk_bounds(len, &cuts) {
                    peer.chunk(&file_id, &data, offset, size).await.unwrap();
                }

                let last = peer.node.events().drain().pop();
                let written = tokio::fs::read(&path).await.unwrap();
                (last, written, data)
            });

            let is_completed = matches!(
                last,
                Some(Event::FileCompleted { transferred_bytes, .. }) if transferred_bytes == len as u64
            );
            prop_assert!(is_completed);
            prop_assert_eq!(written, data);
        }
    }
}
