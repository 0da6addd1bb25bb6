mod common;

use ace_engine::{AceError, OrderedSink, Payload, ResultSink, ResultUnit, VecCommitter};

use anyhow::Result;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::thread;

fn result(index: usize) -> ResultUnit {
    ResultUnit::new(index, Payload::new(index.to_le_bytes().to_vec()))
}

proptest! {
    #[test]
    fn prop_any_arrival_order_commits_ascending(
        order in (1usize..64).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let committed = VecCommitter::new();
        let sink = OrderedSink::new(order.len(), Box::new(committed.clone()));
        for &index in &order {
            prop_assert!(!sink.is_finished());
            sink.submit(result(index)).unwrap();
        }
        prop_assert!(sink.is_finished());
        prop_assert_eq!(sink.pending_len(), 0);
        prop_assert_eq!(committed.indices(), (0..order.len()).collect::<Vec<_>>());
    }

    #[test]
    fn prop_resubmitting_a_committed_index_is_rejected(n in 1usize..32, pick in 0usize..32) {
        let sink = OrderedSink::new(n, Box::new(VecCommitter::new()));
        for index in 0..n {
            sink.submit(result(index)).unwrap();
        }
        let err = sink.submit(result(pick % n)).unwrap_err();
        prop_assert!(matches!(err, AceError::ProtocolViolation { .. }), "got {:?}", err);
    }
}

#[test]
fn test_concurrent_producers_with_seeded_shuffle() -> Result<()> {
    common::init_logging();
    let units = 400;
    let producers = 4;
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let mut order: Vec<usize> = (0..units).collect();
    order.shuffle(&mut rng);

    let committed = VecCommitter::new();
    let sink = Arc::new(OrderedSink::new(units, Box::new(committed.clone())));

    let handles: Vec<_> = order
        .chunks(units / producers)
        .map(|chunk| {
            let sink = sink.clone();
            let chunk = chunk.to_vec();
            thread::spawn(move || -> Result<()> {
                for index in chunk {
                    sink.submit(result(index))?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().map_err(|_| anyhow::anyhow!("producer panicked"))??;
    }

    assert!(sink.is_finished());
    assert_eq!(committed.indices(), (0..units).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_pending_buffer_drains_on_gap_fill() -> Result<()> {
    let committed = VecCommitter::new();
    let sink = OrderedSink::new(5, Box::new(committed.clone()));

    for index in [4, 2, 3, 1] {
        sink.submit(result(index))?;
    }
    assert_eq!(sink.pending_len(), 4);
    assert!(committed.is_empty());

    sink.submit(result(0))?;
    assert_eq!(sink.pending_len(), 0);
    assert_eq!(sink.peak_pending(), 4);
    assert_eq!(committed.indices(), vec![0, 1, 2, 3, 4]);
    Ok(())
}
