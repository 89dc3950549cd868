//! Generators: stackful coroutines with structured yield/resume (§3.4,
//! §4.I), built on `may::coroutine` + its coroutine-aware channels so a
//! suspended generator never blocks its carrier OS thread.
//!
//! Resume protocol built from a yield/resume-channel pair, generalized
//! from a one-shot "weave a quotation" operation into a reusable
//! generator object with Rust-typed yield/return values instead of raw
//! stack effects.

use loom_core::{GeneratorHandle, Value};
use may::sync::mpmc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub enum GeneratorOutcome {
    Yielded(Value),
    Returned(Value),
    Threw(Value),
}

struct GeneratorChannels {
    to_coroutine: mpmc::Sender<Value>,
    from_coroutine: mpmc::Receiver<GeneratorOutcome>,
}

thread_local! {
    /// The yield/resume channel pair for whichever generator body is
    /// currently executing on this coroutine, consulted by `yield_value`.
    static CURRENT: RefCell<Option<(mpmc::Receiver<Value>, mpmc::Sender<GeneratorOutcome>)>> = const { RefCell::new(None) };
}

/// Drop-stack entry: a `defer`/resource-release action recorded while the
/// generator body ran, executed in LIFO order if the generator is
/// collected while still suspended (§4.I).
pub type DropAction = Box<dyn FnOnce() + Send>;

/// A live generator: the coroutine handle is implicit in May's runtime (no
/// handle is exposed by `coroutine::spawn`), so liveness is tracked
/// explicitly via `done`.
pub struct Generator {
    channels: Mutex<GeneratorChannels>,
    done: AtomicBool,
    drop_stack: Mutex<Vec<DropAction>>,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator").field("done", &self.done.load(Ordering::Relaxed)).finish()
    }
}

impl GeneratorHandle for Generator {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    fn on_collected(&self) {
        self.run_drop_stack();
    }
}

impl Generator {
    /// Spawns a coroutine running `body`. `body` receives the first resume
    /// value plus a closure it can call to yield a value and receive the
    /// next resume value; when `body` returns, its result becomes the
    /// generator's final value.
    pub fn spawn<F>(body: F) -> Arc<Self>
    where
        F: FnOnce(Value, &dyn Fn(Value) -> Value) -> Value + Send + 'static,
    {
        let (to_coroutine_tx, to_coroutine_rx) = mpmc::channel::<Value>();
        let (from_coroutine_tx, from_coroutine_rx) = mpmc::channel::<GeneratorOutcome>();

        let gen = Arc::new(Self {
            channels: Mutex::new(GeneratorChannels { to_coroutine: to_coroutine_tx, from_coroutine: from_coroutine_rx }),
            done: AtomicBool::new(false),
            drop_stack: Mutex::new(Vec::new()),
        });

        let reply_tx = from_coroutine_tx;
        let resume_rx = to_coroutine_rx;

        unsafe {
            may::coroutine::spawn(move || {
                CURRENT.with(|cell| {
                    *cell.borrow_mut() = Some((resume_rx.clone(), reply_tx.clone()));
                });

                // Block for the first resume value before running the body:
                // creation alone does not start execution.
                let first = match resume_rx.recv() {
                    Ok(v) => v,
                    Err(_) => return,
                };

                let yielder = move |value: Value| -> Value {
                    CURRENT.with(|cell| {
                        let borrow = cell.borrow();
                        let (rx, tx) = borrow.as_ref().expect("yield called outside a generator body");
                        tx.send(GeneratorOutcome::Yielded(value)).ok();
                        rx.recv().unwrap_or(Value::nil())
                    })
                };

                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(first, &yielder)));
                CURRENT.with(|cell| *cell.borrow_mut() = None);
                match result {
                    Ok(v) => {
                        let _ = reply_tx.send(GeneratorOutcome::Returned(v));
                    }
                    Err(payload) => {
                        let msg = loom_core::error::format_panic_payload(&*payload);
                        let _ = reply_tx.send(GeneratorOutcome::Threw(Value::string(msg)));
                    }
                }
            });
        }

        gen
    }

    /// `strand.resume` equivalent: sends `value` in, blocks until the
    /// coroutine yields, returns, or throws.
    pub fn resume(&self, value: Value) -> GeneratorOutcome {
        if self.is_done() {
            return GeneratorOutcome::Returned(Value::nil());
        }
        let channels = self.channels.lock().expect("generator channel lock poisoned");
        if channels.to_coroutine.send(value).is_err() {
            self.done.store(true, Ordering::Relaxed);
            return GeneratorOutcome::Returned(Value::nil());
        }
        match channels.from_coroutine.recv() {
            Ok(outcome @ (GeneratorOutcome::Returned(_) | GeneratorOutcome::Threw(_))) => {
                self.done.store(true, Ordering::Relaxed);
                outcome
            }
            Ok(outcome) => outcome,
            Err(_) => {
                self.done.store(true, Ordering::Relaxed);
                GeneratorOutcome::Returned(Value::nil())
            }
        }
    }

    pub fn push_drop_action(&self, action: DropAction) {
        self.drop_stack.lock().expect("drop stack lock poisoned").push(action);
    }

    /// Run on collection while still suspended: executes recorded
    /// defer/resource-release actions in LIFO order.
    pub fn run_drop_stack(&self) {
        let mut stack = self.drop_stack.lock().expect("drop stack lock poisoned");
        while let Some(action) = stack.pop() {
            action();
        }
    }
}
