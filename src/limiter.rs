/// A counting semaphore built on a pre-filled bounded channel of tokens.
/// Acquiring recvs a token; dropping the guard sends it back. Used for the
/// EU dial-concurrency cap and the optional IR global session limit, both of
/// which only need "at most N in flight" and not the fairness or poisoning
/// semantics of a full mutex-based primitive.
#[derive(Clone)]
pub struct Limiter {
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl Limiter {
    pub fn new(permits: usize) -> Self {
        let (tx, rx) = async_channel::bounded(permits.max(1));
        for _ in 0..permits {
            tx.try_send(())
                .expect("channel capacity is sized for `permits` tokens");
        }
        Self { tx, rx }
    }

    pub async fn acquire(&self) -> Permit {
        let _ = self.rx.recv().await;
        Permit {
            tx: self.tx.clone(),
        }
    }
}

pub struct Permit {
    tx: async_channel::Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_concurrent_holders() {
        smolscale::block_on(async {
            let limiter = Limiter::new(2);
            let a = limiter.acquire().await;
            let b = limiter.acquire().await;
            assert!(limiter.rx.try_recv().is_err());
            drop(a);
            assert!(limiter.rx.try_recv().is_ok());
            drop(b);
        });
    }
}
