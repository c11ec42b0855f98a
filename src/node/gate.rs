//! Non-queuing guard around the steering pass.

use std::sync::atomic::{AtomicBool, Ordering};

/// Runs at most one steering pass at a time per node.
///
/// A trigger that arrives while a pass is running does not wait: it marks
/// the gate dirty and returns. The running caller repeats the pass once for
/// all triggers collected while it was busy, so there is never more than one
/// pending pass.
#[derive(Debug, Default)]
pub struct SteerGate {
    running: AtomicBool,
    dirty: AtomicBool,
}

/// Clears `running` even if the pass panics.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SteerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `pass` unless another caller is already inside.
    ///
    /// Returns the number of passes this caller executed; `0` means the
    /// trigger was folded into the in-flight pass.
    pub fn run(&self, pass: impl FnMut()) -> usize {
        self.run_contended(pass, || {})
    }

    /// [`run`](Self::run), calling `contended` each time entry fails and
    /// before the trigger is recorded.
    fn run_contended(&self, mut pass: impl FnMut(), mut contended: impl FnMut()) -> usize {
        let mut passes = 0;
        loop {
            if self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                contended();
                if passes > 0 {
                    // whoever got in started after our last pass
                    return passes;
                }
                self.dirty.store(true, Ordering::SeqCst);
                // The holder may have released and checked `dirty` before
                // the store above; then nobody would pick the trigger up.
                if self.running.load(Ordering::SeqCst) {
                    return passes;
                }
                continue;
            }
            {
                let _running = Running(&self.running);
                self.dirty.store(false, Ordering::SeqCst);
                pass();
                passes += 1;
            }
            if !self.dirty.load(Ordering::SeqCst) {
                return passes;
            }
        }
    }

    /// Whether a pass is in flight.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::*;

    #[test]
    fn idle_gate_runs_once() {
        let gate = SteerGate::new();
        let mut count = 0;
        assert_eq!(gate.run(|| count += 1), 1);
        assert_eq!(count, 1);
        assert!(!gate.is_running());
    }

    #[test]
    fn reentrant_triggers_collapse_into_one_rerun() {
        let gate = SteerGate::new();
        let mut outer = 0;
        let passes = gate.run(|| {
            outer += 1;
            if outer == 1 {
                // three triggers while busy
                assert_eq!(gate.run(|| unreachable!()), 0);
                assert_eq!(gate.run(|| unreachable!()), 0);
                assert_eq!(gate.run(|| unreachable!()), 0);
            }
        });
        assert_eq!(passes, 2);
        assert_eq!(outer, 2);
    }

    #[test]
    fn concurrent_triggers_never_overlap() {
        let gate = Arc::new(SteerGate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (gate, inside, total, barrier) =
                    (gate.clone(), inside.clone(), total.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    gate.run(|| {
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(std::time::Duration::from_millis(5));
                        total.fetch_add(1, Ordering::SeqCst);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        let total = total.load(Ordering::SeqCst);
        assert!((1..=8).contains(&total));
        assert!(!gate.is_running());
    }

    #[test]
    fn panic_inside_pass_releases_gate() {
        let gate = SteerGate::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gate.run(|| panic!("boom"));
        }));
        assert!(result.is_err());
        assert!(!gate.is_running());
        assert_eq!(gate.run(|| {}), 1);
    }

    #[test]
    fn trigger_racing_the_release_is_not_lost() {
        let gate = Arc::new(SteerGate::new());
        let total = Arc::new(AtomicUsize::new(0));
        let (in_pass_tx, in_pass_rx) = mpsc::channel();
        let (contended_tx, contended_rx) = mpsc::channel();

        let holder = {
            let (gate, total) = (gate.clone(), total.clone());
            let mut signal = Some((in_pass_tx, contended_rx));
            thread::spawn(move || {
                gate.run(|| {
                    total.fetch_add(1, Ordering::SeqCst);
                    if let Some((in_pass, contended)) = signal.take() {
                        in_pass.send(()).expect("send");
                        contended.recv().expect("recv");
                    }
                })
            })
        };

        in_pass_rx.recv().expect("holder in pass");
        // Entry fails while the holder is inside; the holder then finishes,
        // releases and checks for triggers before this one is recorded.
        let mut holder = Some(holder);
        let mut holder_passes = None;
        let passes = gate.run_contended(
            || {
                total.fetch_add(1, Ordering::SeqCst);
            },
            || {
                if let Some(handle) = holder.take() {
                    contended_tx.send(()).expect("send");
                    holder_passes = Some(handle.join().expect("holder"));
                }
            },
        );

        assert_eq!(holder_passes, Some(1));
        assert_eq!(passes, 1);
        assert_eq!(total.load(Ordering::SeqCst), 2);
        assert!(!gate.is_running());
        assert!(!gate.dirty.load(Ordering::SeqCst));
    }
}
