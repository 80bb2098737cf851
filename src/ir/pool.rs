use std::time::{Duration, Instant};

/// One idle EU-originated TCP connection sitting in the bridge pool.
pub struct PooledConnection {
    pub stream: smol::net::TcpStream,
    pub created_at: Instant,
}

/// Bounded queue of idle reverse connections dialed in by EU workers and
/// drawn by the session dispatcher. `put` never blocks: on a full queue the
/// rejected connection is simply closed, so the EU side notices and
/// reconnects. Capacity is `2 * pool_size` to absorb bursts of EU dials
/// without rejecting connections that are about to be drawn.
#[derive(Clone)]
pub struct BridgePool {
    tx: async_channel::Sender<PooledConnection>,
    rx: async_channel::Receiver<PooledConnection>,
}

impl BridgePool {
    pub fn new(pool_size: usize) -> Self {
        let capacity = pool_size.max(1) * 2;
        let (tx, rx) = async_channel::bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueues `conn`, closing it instead of blocking if the pool is full.
    pub fn put(&self, conn: PooledConnection) {
        if let Err(async_channel::TrySendError::Full(_)) = self.tx.try_send(conn) {
            tracing::debug!("bridge pool full, closing rejected connection");
        }
    }

    /// Waits up to `timeout` for an idle connection to become available.
    pub async fn get(&self, timeout: Duration) -> Option<PooledConnection> {
        use smol_timeout2::TimeoutExt;
        self.rx.recv().timeout(timeout).await?.ok()
    }

    /// Non-blocking draw, used by the health pinger.
    pub fn try_take(&self) -> Option<PooledConnection> {
        self.rx.try_recv().ok()
    }

    /// Drains the whole queue, closing connections older than `max_age` and
    /// re-enqueuing the rest. Not linearizable against concurrent `put`s
    /// arriving mid-drain, but that's fine: such a connection is simply
    /// caught by the next recycle pass instead of this one.
    pub fn recycle_stale(&self, max_age: Duration) {
        let mut survivors = Vec::new();
        while let Some(conn) = self.try_take() {
            if conn.created_at.elapsed() >= max_age {
                tracing::debug!("recycler closing aged-out pool connection");
            } else {
                survivors.push(conn);
            }
        }
        for conn in survivors {
            self.put(conn);
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smol::net::{TcpListener, TcpStream};

    async fn loopback_stream() -> smol::net::TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (a, (b, _)) =
            futures_util::future::join(TcpStream::connect(addr), async { listener.accept().await })
                .await;
        drop(b.unwrap()); // only `created_at` bookkeeping is exercised, not I/O
        a.unwrap()
    }

    async fn fake_conn(age: Duration) -> PooledConnection {
        PooledConnection {
            stream: loopback_stream().await,
            created_at: Instant::now() - age,
        }
    }

    #[test]
    fn put_never_blocks_on_overflow() {
        smolscale::block_on(async {
            let pool = BridgePool::new(1); // capacity 2
            pool.put(fake_conn(Duration::ZERO).await);
            pool.put(fake_conn(Duration::ZERO).await);
            pool.put(fake_conn(Duration::ZERO).await); // dropped, not blocked
            assert_eq!(pool.len(), 2);
        });
    }

    #[test]
    fn recycle_stale_drops_aged_out_connections() {
        smolscale::block_on(async {
            let pool = BridgePool::new(4);
            pool.put(fake_conn(Duration::from_secs(100)).await);
            pool.put(fake_conn(Duration::from_secs(1)).await);
            pool.recycle_stale(Duration::from_secs(50));
            assert_eq!(pool.len(), 1);
        });
    }
}
