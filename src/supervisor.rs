use std::future::Future;
use std::time::Duration;

use crate::net::sleep_or_stop;
use crate::stop::StopSignal;

const BACKOFF_START: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Wraps a long-running task factory in a restart-with-backoff loop. Most of
/// the tasks supervised here never return under normal operation (they loop
/// internally until `stop` fires), so this is a crash backstop rather than
/// the primary retry mechanism; the EU dialer and AutoSync client manage
/// their own reconnect backoff internally for the common case.
pub async fn supervise<F, Fut>(name: &'static str, stop: &'static StopSignal, mut make_task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backoff = BACKOFF_START;
    while !stop.is_set() {
        match make_task().await {
            Ok(()) => {
                tracing::warn!(task = name, "supervised task returned, restarting");
            }
            Err(err) => {
                tracing::error!(task = name, err = %err, "supervised task failed, restarting");
            }
        }
        if stop.is_set() {
            break;
        }
        if !sleep_or_stop(backoff, stop).await {
            break;
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
    tracing::debug!(task = name, "supervised task stopped");
}

/// Like `supervise`, but for tasks whose only realistic failure mode is an
/// unrecoverable startup error (a listener that can't bind its port): after
/// `max_attempts` consecutive failures it gives up and returns `Err` instead
/// of retrying forever, so a persistently-unbindable port can be treated as
/// the fatal configuration error it is rather than looping under backoff
/// until the process is killed from outside.
pub async fn supervise_or_fatal<F, Fut>(
    name: &'static str,
    stop: &'static StopSignal,
    max_attempts: u32,
    mut make_task: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backoff = BACKOFF_START;
    let mut attempts = 0u32;
    while !stop.is_set() {
        match make_task().await {
            Ok(()) => {
                if stop.is_set() {
                    break;
                }
                tracing::warn!(task = name, "supervised task returned, restarting");
                attempts = 0;
            }
            Err(err) => {
                attempts += 1;
                tracing::error!(task = name, err = %err, attempts, max_attempts, "supervised task failed");
                if attempts >= max_attempts {
                    anyhow::bail!("{name} failed {attempts} times in a row, giving up: {err}");
                }
            }
        }
        if stop.is_set() {
            break;
        }
        if !sleep_or_stop(backoff, stop).await {
            break;
        }
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
    tracing::debug!(task = name, "supervised task stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn supervise_or_fatal_gives_up_after_max_attempts() {
        smolscale::block_on(async {
            let stop: &'static StopSignal = Box::leak(Box::new(StopSignal::new()));
            let calls = Box::leak(Box::new(AtomicU32::new(0)));

            let result = supervise_or_fatal("test-task", stop, 3, move || {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err(anyhow::anyhow!("always fails")) }
            })
            .await;

            assert!(result.is_err(), "should give up once the retry budget is spent");
            assert_eq!(calls.load(Ordering::Relaxed), 3);
        });
    }

    #[test]
    fn supervise_or_fatal_resets_budget_after_a_clean_return() {
        smolscale::block_on(async {
            let stop: &'static StopSignal = Box::leak(Box::new(StopSignal::new()));
            let calls = Box::leak(Box::new(AtomicU32::new(0)));

            let result = supervise_or_fatal("test-task", stop, 2, move || {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n == 0 {
                        Err(anyhow::anyhow!("first attempt fails"))
                    } else {
                        // a clean return resets the attempt counter; since
                        // this is the second call, stopping here proves the
                        // single earlier failure alone never exhausts a
                        // budget of 2
                        stop.trigger();
                        Ok(())
                    }
                }
            })
            .await;

            assert!(result.is_ok());
            assert_eq!(calls.load(Ordering::Relaxed), 2);
        });
    }
}
