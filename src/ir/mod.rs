pub mod autosync_acceptor;
pub mod bridge_acceptor;
pub mod dispatcher;
pub mod health;
pub mod listener_controller;
pub mod pool;

use std::sync::Arc;

use crate::config::{IrConfig, Tunables};
use crate::limiter::Limiter;
use crate::stop::StopSignal;
use crate::supervisor::{supervise, supervise_or_fatal};

use listener_controller::ListenerController;
use pool::BridgePool;

/// Consecutive bind failures the bridge/sync acceptors tolerate before
/// `run` gives up and returns an error. Each attempt is separated by the
/// same capped backoff `supervise` uses, so this bounds how long a
/// persistently-unbindable port is retried before it's treated as the
/// fatal configuration error it is, rather than retried forever.
const BIND_RETRY_BUDGET: u32 = 5;

/// Runs the IR role until `stop` fires: the bridge acceptor, the pool
/// pinger and recycler, and (if enabled) the AutoSync acceptor, each under
/// its own supervisor. With AutoSync disabled, the manual port list is
/// applied once up front and never changes.
///
/// Returns `Err` if the bridge or sync port can't be bound even after
/// retrying `BIND_RETRY_BUDGET` times; the caller (`main`) exits non-zero
/// in that case rather than leaving the process running with no way for
/// EU workers or AutoSync to ever reach it.
pub async fn run(
    config: IrConfig,
    tunables: &'static Tunables,
    stop: &'static StopSignal,
) -> anyhow::Result<()> {
    let pool = BridgePool::new(config.pool_size);
    let controller = Arc::new(ListenerController::new(
        tunables.ir_bind,
        config.bridge_port,
        config.sync_port,
    ));
    let session_limiter = if tunables.max_sessions > 0 {
        Some(Limiter::new(tunables.max_sessions))
    } else {
        None
    };

    if !config.auto_sync {
        controller.apply_desired(
            config.manual_ports.clone(),
            &pool,
            tunables,
            stop,
            session_limiter.clone(),
        );
    }

    let bridge_port = config.bridge_port;
    let sync_port = config.sync_port;
    let mut tasks: Vec<smol::Task<anyhow::Result<()>>> = Vec::new();

    tasks.push(smolscale::spawn({
        let pool = pool.clone();
        supervise_or_fatal("ir-bridge-acceptor", stop, BIND_RETRY_BUDGET, move || {
            bridge_acceptor::run(tunables.ir_bind, bridge_port, pool.clone(), tunables, stop)
        })
    }));

    tasks.push(smolscale::spawn({
        let pool = pool.clone();
        async move {
            supervise("ir-pinger", stop, move || {
                health::pinger_loop(pool.clone(), tunables, stop)
            })
            .await;
            Ok(())
        }
    }));

    tasks.push(smolscale::spawn({
        let pool = pool.clone();
        async move {
            supervise("ir-recycler", stop, move || {
                health::recycler_loop(pool.clone(), tunables, stop)
            })
            .await;
            Ok(())
        }
    }));

    if config.auto_sync {
        tasks.push(smolscale::spawn({
            let pool = pool.clone();
            let controller = controller.clone();
            let session_limiter = session_limiter.clone();
            supervise_or_fatal("ir-autosync-acceptor", stop, BIND_RETRY_BUDGET, move || {
                autosync_acceptor::run(
                    tunables.ir_bind,
                    sync_port,
                    controller.clone(),
                    pool.clone(),
                    tunables,
                    stop,
                    session_limiter.clone(),
                )
            })
        }));
    }

    // None of these tasks normally return before `stop` fires, so the first
    // one to finish early is either a graceful shutdown in progress or a
    // fatal bind failure that exhausted its retry budget. Racing instead of
    // joining in declaration order means a fatal failure in a later task
    // (e.g. the autosync acceptor) is noticed even while an earlier task
    // (e.g. the bridge acceptor) is still happily running.
    let mut pending = tasks;
    while !pending.is_empty() {
        let (result, _index, remaining) = futures_util::future::select_all(pending).await;
        pending = remaining;
        if let Err(err) = result {
            tracing::error!(err = %err, "fatal IR startup failure, shutting down");
            stop.trigger();
            for task in pending {
                task.await.ok();
            }
            return Err(err);
        }
    }
    Ok(())
}
