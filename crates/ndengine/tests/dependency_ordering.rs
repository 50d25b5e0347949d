//! Property tests for per-variable grant ordering.
//!
//! Key invariants:
//! - For any two operations touching the same variable where at least one
//!   writes it, the earlier-pushed operation finishes before the later starts
//! - Reads with no interposed writer may overlap

mod support;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ndengine::{Context, OpDescriptor, Scheduler, Var};
use proptest::prelude::*;

const VARS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Use {
    None,
    Read,
    Write,
}

// ── strategies ────────────────────────────────────────────────────────────

fn arb_use() -> impl Strategy<Value = Use> {
    prop_oneof![Just(Use::None), Just(Use::Read), Just(Use::Write)]
}

fn arb_op() -> impl Strategy<Value = (Vec<Use>, u64, bool)> {
    (
        prop::collection::vec(arb_use(), VARS),
        0u64..300, // body duration in microseconds
        any::<bool>(), // async body
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct Span {
    start: u64,
    end: u64,
}

fn conflicts(a: Use, b: Use) -> bool {
    matches!((a, b), (Use::Write, Use::Read | Use::Write) | (Use::Read, Use::Write))
}

fn run_program(ops: &[(Vec<Use>, u64, bool)], workers: usize) -> Vec<Span> {
    let engine = support::engine(workers);
    let vars: Vec<Var> = (0..VARS).map(|_| engine.new_variable()).collect();
    let clock = Arc::new(AtomicU64::new(1));
    let spans = Arc::new(Mutex::new(vec![Span::default(); ops.len()]));

    for (index, (uses, micros, is_async)) in ops.iter().enumerate() {
        let select = |want: Use| -> Vec<Var> {
            uses.iter().zip(&vars).filter(|(u, _)| **u == want).map(|(_, v)| *v).collect()
        };
        let (reads, writes) = (select(Use::Read), select(Use::Write));
        let delay = Duration::from_micros(*micros);
        let clock = Arc::clone(&clock);
        let spans = Arc::clone(&spans);

        let op = if *is_async {
            OpDescriptor::new_async(Context::cpu(0), move |_, done| {
                let start = clock.fetch_add(1, Ordering::SeqCst);
                thread::spawn(move || {
                    thread::sleep(delay);
                    let end = clock.fetch_add(1, Ordering::SeqCst);
                    spans.lock().unwrap()[index] = Span { start, end };
                    done.complete();
                });
            })
        } else {
            OpDescriptor::new_sync(Context::cpu(0), move |_| {
                let start = clock.fetch_add(1, Ordering::SeqCst);
                thread::sleep(delay);
                let end = clock.fetch_add(1, Ordering::SeqCst);
                spans.lock().unwrap()[index] = Span { start, end };
                Ok(())
            })
        };
        engine.push_async(op.reads(reads).writes(writes).name(format!("op{index}"))).unwrap();
    }

    engine.wait_all().unwrap();
    let spans = spans.lock().unwrap().clone();
    spans
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Conflicting accesses to one variable never overlap and keep push order.
    #[test]
    fn conflicting_accesses_follow_push_order(
        ops in prop::collection::vec(arb_op(), 1..32),
        workers in 1usize..5,
    ) {
        let spans = run_program(&ops, workers);

        for span in &spans {
            prop_assert!(
                span.start > 0 && span.end > span.start,
                "operation never ran: {:?}",
                span
            );
        }
        for later in 0..ops.len() {
            for earlier in 0..later {
                let shared_conflict =
                    (0..VARS).any(|v| conflicts(ops[earlier].0[v], ops[later].0[v]));
                if shared_conflict {
                    prop_assert!(
                        spans[earlier].end < spans[later].start,
                        "op{} {:?} overlaps or precedes op{} {:?}",
                        later, spans[later], earlier, spans[earlier]
                    );
                }
            }
        }
    }
}

#[test]
fn readers_between_writers_overlap() {
    let engine = support::engine(4);
    let var = engine.new_variable();
    let gate = support::Gate::new();
    let running = Arc::new(AtomicU64::new(0));
    let peak = Arc::new(AtomicU64::new(0));

    for _ in 0..3 {
        let (gate, running, peak) = (Arc::clone(&gate), Arc::clone(&running), Arc::clone(&peak));
        engine
            .push_async(
                OpDescriptor::new_sync(Context::cpu(0), move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    if now == 3 {
                        gate.open();
                    }
                    gate.wait();
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .reads([var]),
            )
            .unwrap();
    }

    engine.wait_all().unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 3);
}
