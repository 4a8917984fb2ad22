use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use specter_h3::transport::{Connection, Dialer, QuicConfig, TlsConfig, TransportError};

/// Dialer that hands out a prepared connection (or a prepared failure) and
/// counts how often it was asked.
pub struct MockDialer {
    outcome: Result<Arc<dyn Connection>, TransportError>,
    delay: Duration,
    dials: AtomicUsize,
}

#[allow(dead_code)]
impl MockDialer {
    pub fn new(conn: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(conn),
            delay: Duration::ZERO,
            dials: AtomicUsize::new(0),
        })
    }

    pub fn failing(err: TransportError) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(err),
            delay: Duration::ZERO,
            dials: AtomicUsize::new(0),
        })
    }

    /// Hold every dial for `delay` before answering.
    pub fn delayed(conn: Arc<dyn Connection>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(conn),
            delay,
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        authority: &str,
        _tls: &TlsConfig,
        _quic: &QuicConfig,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(%authority, "mock dial");
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome.clone()
    }
}
