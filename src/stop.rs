use std::sync::atomic::{AtomicBool, Ordering};

use async_event::Event;

/// Process-wide cooperative shutdown signal. `trigger()` is called once from
/// the SIGINT/SIGTERM handler; every long-running loop races its own work
/// against `wait()` so it notices the flag without polling.
pub struct StopSignal {
    flag: AtomicBool,
    event: Event,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            event: Event::new(),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.event.notify_all();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger()` has been called, even if that already
    /// happened before this call.
    pub async fn wait(&self) {
        self.event
            .wait_until(|| if self.is_set() { Some(()) } else { None })
            .await
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_before_wait_resolves_immediately() {
        smolscale::block_on(async {
            let stop = StopSignal::new();
            stop.trigger();
            stop.wait().await;
            assert!(stop.is_set());
        });
    }

    #[test]
    fn trigger_after_wait_wakes_waiter() {
        smolscale::block_on(async {
            let stop = std::sync::Arc::new(StopSignal::new());
            let waiter = {
                let stop = stop.clone();
                smolscale::spawn(async move {
                    stop.wait().await;
                })
            };
            smol::Timer::after(std::time::Duration::from_millis(20)).await;
            stop.trigger();
            waiter.await;
        });
    }
}
