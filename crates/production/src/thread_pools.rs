//! Dedicated thread pool for signature work.
//!
//! Certificate and signature verification never runs on the state machine
//! task; it is spawned onto this rayon pool and its result returns through
//! the event channel.

use thiserror::Error;

/// Thread pool configuration.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    /// Threads dedicated to signature work.
    pub crypto_threads: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            crypto_threads: (cores / 4).max(1),
        }
    }
}

/// Errors from building the pools.
#[derive(Debug, Error)]
pub enum ThreadPoolError {
    #[error("failed to build crypto pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
}

/// Owns the worker pools of one replica process.
pub struct ThreadPoolManager {
    crypto: rayon::ThreadPool,
}

impl ThreadPoolManager {
    /// Build the pools.
    pub fn new(config: ThreadPoolConfig) -> Result<Self, ThreadPoolError> {
        let crypto = rayon::ThreadPoolBuilder::new()
            .num_threads(config.crypto_threads)
            .thread_name(|i| format!("trellis-crypto-{i}"))
            .build()?;
        Ok(Self { crypto })
    }

    /// The signature verification pool.
    pub fn crypto(&self) -> &rayon::ThreadPool {
        &self.crypto
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_at_least_one_thread() {
        assert!(ThreadPoolConfig::default().crypto_threads >= 1);
    }

    #[test]
    fn pool_executes_work() {
        let pools = ThreadPoolManager::new(ThreadPoolConfig { crypto_threads: 2 }).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        pools.crypto().spawn(move || {
            tx.send(1 + 1).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 2);
    }
}
