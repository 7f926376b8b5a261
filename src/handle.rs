use std::{
    fmt,
    sync::Arc,
};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;


/// Handle на выполняющуюся задачу: время работы и сигнал `die`
#[derive(Clone)]
pub struct RunningHandle {
    id: u64,
    label: Arc<str>,
    started: Instant,
    die: CancellationToken,
}

impl RunningHandle {

    pub(crate) fn new
    (
        id: u64,
        label: &str,
        die: CancellationToken,
    ) -> Self {
        Self {
            id,
            label: Arc::from(label),
            started: Instant::now(),
            die,
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Кооперативная отмена: задача увидит сигнал при следующей проверке токена
    pub fn kill(&self) {
        if !self.die.is_cancelled() {
            warn!(task = %self.label, id = self.id, runtime_ms = self.elapsed().as_millis() as u64, "killing task");
            self.die.cancel();
        }
    }

    #[inline]
    pub fn is_killed(&self) -> bool {
        self.die.is_cancelled()
    }
}

impl fmt::Debug for RunningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("elapsed", &self.elapsed())
            .field("killed", &self.is_killed())
            .finish()
    }
}
