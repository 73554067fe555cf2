use pstream::{Partition, SlotLocal, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Stand-in for an expensive per-thread resource.
struct Session {
    slot: usize,
    uses: usize,
}

#[test]
fn test_values_survive_across_jobs() {
    let pool = WorkerPool::new(3).unwrap();
    let sessions = Arc::new(SlotLocal::<Session>::new(&pool));
    let created = Arc::new(AtomicUsize::new(0));

    let run = pool.bind(
        |items: Partition<usize>, args: &(Arc<SlotLocal<Session>>, Arc<AtomicUsize>)| {
            let (sessions, created) = args;
            for _ in items {
                sessions.with(
                    |slot| {
                        created.fetch_add(1, Ordering::SeqCst);
                        Session { slot, uses: 0 }
                    },
                    |session| session.uses += 1,
                )?;
            }
            Ok(())
        },
    );

    for _ in 0..4 {
        run.run_with_workers(3, 0..30, (Arc::clone(&sessions), Arc::clone(&created)))
            .unwrap();
    }

    assert!(created.load(Ordering::SeqCst) <= 3);
    let values = sessions.take_all();
    let total: usize = values.iter().flatten().map(|s| s.uses).sum();
    assert_eq!(total, 120);
    for (slot, value) in values.iter().enumerate() {
        if let Some(session) = value {
            assert_eq!(session.slot, slot);
        }
    }
    assert_eq!(sessions.initialized(), 0);
}

#[test]
fn test_prime_initializes_every_slot_once() {
    let pool = WorkerPool::new(4).unwrap();
    let local = Arc::new(SlotLocal::<usize>::new(&pool));
    let inits = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let inits = Arc::clone(&inits);
        local
            .prime(&pool, move |slot| {
                inits.fetch_add(1, Ordering::SeqCst);
                slot + 100
            })
            .unwrap();
    }

    assert_eq!(inits.load(Ordering::SeqCst), 4);
    assert_eq!(local.initialized(), 4);
    assert!((0..4).all(|slot| local.is_initialized(slot)));
    assert!(!local.is_initialized(4));
    assert_eq!(local.take_all(), vec![Some(100), Some(101), Some(102), Some(103)]);
}

#[test]
fn test_with_existing_does_not_create() {
    let pool = WorkerPool::new(2).unwrap();
    let local = Arc::new(SlotLocal::<u8>::new(&pool));

    let shared = Arc::clone(&local);
    let seen = pool
        .broadcast(move |_| shared.with_existing(|v| *v).unwrap())
        .unwrap();
    assert_eq!(seen, vec![None, None]);
    assert_eq!(local.initialized(), 0);
}
