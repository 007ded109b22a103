//! Property tests for the per-key ordinal guard.
//!
//! Writes carry explicit ordinals and are delivered in arbitrary order; the
//! surviving value of every key must be the one with the highest ordinal.

use padlink::connection;
use padlink::session::Session;
use padlink::virtual_controller::{MemoryFactory, Mode};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const KEYS: [&str; 8] = ["LSx", "LSy", "RSx", "RSy", "LT", "RT", "A", "B"];

#[derive(Debug, Clone)]
struct Write {
    ordinal: u64,
    key: &'static str,
    value: f32,
}

impl Write {
    fn line(&self) -> String {
        format!("@{} set {} {}", self.ordinal, self.key, self.value)
    }
}

/// Writes with strictly increasing ordinals, so ordinals also increase per key.
fn ordered_writes() -> impl Strategy<Value = Vec<Write>> {
    prop::collection::vec((0..KEYS.len(), 1u64..4, 0u8..=100), 1..40).prop_map(|steps| {
        let mut ordinal = 0;
        steps
            .into_iter()
            .map(|(key, step, value)| {
                ordinal += step;
                Write {
                    ordinal,
                    key: KEYS[key],
                    value: f32::from(value) / 100.0,
                }
            })
            .collect()
    })
}

/// The same writes in a shuffled delivery order, next to the original order.
fn shuffled_writes() -> impl Strategy<Value = (Vec<Write>, Vec<Write>)> {
    ordered_writes().prop_flat_map(|writes| (Just(writes.clone()), Just(writes).prop_shuffle()))
}

fn winners(writes: &[Write]) -> HashMap<&'static str, f32> {
    let mut latest: HashMap<&'static str, &Write> = HashMap::new();
    for write in writes {
        let newer = latest
            .get(write.key)
            .map_or(true, |seen| write.ordinal > seen.ordinal);
        if newer {
            latest.insert(write.key, write);
        }
    }
    latest
        .into_iter()
        .map(|(key, write)| (key, write.value))
        .collect()
}

fn session() -> (Session, connection::ChannelPeer, MemoryFactory) {
    let factory = MemoryFactory::new();
    let (conn, peer) = connection::channel();
    let mut session = Session::new(
        0,
        Mode::Xbox,
        Arc::new(factory.clone()),
        Box::new(conn),
        CancellationToken::new(),
    );
    session.start().unwrap();
    (session, peer, factory)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The highest ordinal per key wins, whatever the arrival order and batching.
    #[test]
    fn prop_highest_ordinal_wins((writes, delivery) in shuffled_writes(), batch in 1usize..4) {
        let (mut session, _peer, _factory) = session();
        let lines: Vec<String> = delivery.iter().map(Write::line).collect();

        runtime().block_on(async {
            for chunk in lines.chunks(batch) {
                session.handle_message(&chunk.join("\n")).await;
            }
        });

        let expected = winners(&writes);
        prop_assert_eq!(session.state().len(), expected.len());
        for (key, value) in expected {
            prop_assert_eq!(session.state().get(key), Some(&value), "key {}", key);
        }
    }

    /// Replaying any ordinal at or below the last accepted one changes nothing.
    #[test]
    fn prop_replayed_ordinals_are_ignored(
        writes in ordered_writes(),
        replays in prop::collection::vec((any::<prop::sample::Index>(), 0u8..=100), 1..20),
    ) {
        let (mut session, _peer, factory) = session();
        let handle = factory.last().unwrap();

        runtime().block_on(async {
            for write in &writes {
                session.handle_message(&write.line()).await;
            }
        });
        let before: BTreeMap<String, f32> = session.state().clone();
        let commits = handle.commits();

        runtime().block_on(async {
            for (index, value) in &replays {
                let replay = Write {
                    value: f32::from(*value) / 100.0 - 0.5,
                    ..index.get(&writes).clone()
                };
                session.handle_message(&replay.line()).await;
            }
        });

        prop_assert_eq!(session.state(), &before);
        prop_assert_eq!(handle.commits(), commits);
    }
}
