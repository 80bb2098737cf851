pub mod autosync_client;
pub mod dialer;

use crate::config::{EuConfig, Tunables};
use crate::limiter::Limiter;
use crate::stop::StopSignal;
use crate::supervisor::supervise;

/// Runs the EU role until `stop` fires: `pool_size` dialer workers, each
/// under its own supervisor, plus the AutoSync client if enabled.
pub async fn run(config: EuConfig, tunables: &'static Tunables, stop: &'static StopSignal) {
    let dial_limiter = Limiter::new(tunables.dial_concurrency);
    let mut tasks = Vec::new();

    for worker_id in 0..config.pool_size {
        let eu = config.clone();
        let dial_limiter = dial_limiter.clone();
        tasks.push(smolscale::spawn(supervise(
            "eu-dialer",
            stop,
            move || dialer::dialer_worker(worker_id, eu.clone(), tunables, dial_limiter.clone(), stop),
        )));
    }

    if config.enable_autosync {
        let eu = config.clone();
        tasks.push(smolscale::spawn(supervise("eu-autosync-client", stop, move || {
            autosync_client::run(eu.clone(), tunables, stop)
        })));
    }

    for task in tasks {
        task.await;
    }
}
