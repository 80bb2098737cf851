use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use crate::config::Tunables;
use crate::limiter::Limiter;
use crate::net::bind_tcp_listener;
use crate::stop::StopSignal;

use super::dispatcher::accept_loop;
use super::pool::BridgePool;

/// Owns the set of currently-open user-facing listeners and reconciles it
/// against a desired port set pushed in by AutoSync (or set once from the
/// manual port list). Dropping a listener's task closes its socket but
/// leaves any already-spawned sessions on that port running to completion.
pub struct ListenerController {
    bind: IpAddr,
    bridge_port: u16,
    sync_port: u16,
    active: Mutex<HashMap<u16, smol::Task<()>>>,
}

impl ListenerController {
    pub fn new(bind: IpAddr, bridge_port: u16, sync_port: u16) -> Self {
        Self {
            bind,
            bridge_port,
            sync_port,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_ports(&self) -> HashSet<u16> {
        self.active.lock().unwrap().keys().copied().collect()
    }

    /// Replaces the desired port set. Sanitizes first (drops port 0 and the
    /// reserved bridge/sync ports), then snapshots the open/close diff under
    /// the lock before doing any blocking bind work, and only re-takes the
    /// lock briefly to apply it. Re-applying the same set is a no-op.
    pub fn apply_desired(
        &self,
        desired: impl IntoIterator<Item = u16>,
        pool: &BridgePool,
        tunables: &'static Tunables,
        stop: &'static StopSignal,
        session_limiter: Option<Limiter>,
    ) {
        let desired: HashSet<u16> = desired
            .into_iter()
            .filter(|&p| p != 0 && p != self.bridge_port && p != self.sync_port)
            .collect();

        let (to_open, to_close): (Vec<u16>, Vec<u16>) = {
            let active = self.active.lock().unwrap();
            let active_set: HashSet<u16> = active.keys().copied().collect();
            (
                desired.difference(&active_set).copied().collect(),
                active_set.difference(&desired).copied().collect(),
            )
        };

        for port in to_close {
            if let Some(task) = self.active.lock().unwrap().remove(&port) {
                tracing::info!(port, "closing listener, port left the desired set");
                drop(task);
            }
        }

        for port in to_open {
            match bind_tcp_listener((self.bind, port).into(), tunables.backlog_ports) {
                Ok(listener) => {
                    tracing::info!(port, "opening listener for newly desired port");
                    let pool = pool.clone();
                    let session_limiter = session_limiter.clone();
                    let task =
                        smolscale::spawn(accept_loop(listener, port, pool, tunables, stop, session_limiter));
                    self.active.lock().unwrap().insert(port, task);
                }
                Err(err) => {
                    tracing::warn!(port, err = %err, "failed to bind user-facing listener, skipping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[traced_test]
    #[test]
    fn diffing_is_idempotent_and_drops_reserved_ports() {
        smolscale::block_on(async {
            let controller = ListenerController::new("127.0.0.1".parse().unwrap(), 7000, 7001);
            let pool = BridgePool::new(4);
            let tunables: &'static Tunables = Box::leak(Box::new(Tunables::from_env()));
            let stop: &'static StopSignal = Box::leak(Box::new(StopSignal::new()));

            controller.apply_desired([7000, 7001, 0, 9000], &pool, tunables, stop, None);
            assert_eq!(controller.active_ports(), [9000].into_iter().collect());

            // re-applying the same effective set changes nothing
            controller.apply_desired([9000], &pool, tunables, stop, None);
            assert_eq!(controller.active_ports(), [9000].into_iter().collect());

            controller.apply_desired([], &pool, tunables, stop, None);
            assert!(controller.active_ports().is_empty());

            stop.trigger();
        });
    }
}
