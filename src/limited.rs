use super::stats::StatsAccumulator;
use futures::stream::{FuturesUnordered, StreamExt};
use std::{future::Future, sync::Arc};
use tokio::{
    sync::Semaphore,
    task::JoinHandle,
    time::{Duration, Instant},
};
use tracing::debug;


/// Результат пакетного выполнения с ограничением по времени
#[derive(Debug, Clone)]
pub struct ExecutionInfo<T> {
    time_limit: Duration,
    num: usize,
    started: Instant,
    finished: Option<Instant>,
    /// Время от старта пакета до каждого результата, мс
    op_times: StatsAccumulator,
    results: Vec<T>,
}

impl<T> ExecutionInfo<T> {
    fn new(time_limit: Duration, num: usize) -> Self {
        Self {
            time_limit,
            num,
            started: Instant::now(),
            finished: None,
            op_times: StatsAccumulator::new(),
            results: Vec::with_capacity(num),
        }
    }

    /// false, когда ждать больше нечего: собраны все результаты или время вышло
    fn add_result(&mut self, result: T) -> bool {
        let now = Instant::now();
        self.results.push(result);
        self.op_times.add(now.duration_since(self.started).as_secs_f64() * 1000.0);

        if self.results.len() == self.num || now.duration_since(self.started) > self.time_limit {
            self.finished = Some(now);
            return false;
        }
        true
    }

    fn close(&mut self) {
        self.finished.get_or_insert_with(Instant::now);
    }

    /// Время до истечения лимита
    pub fn remaining(&self) -> Duration {
        self.time_limit.saturating_sub(self.started.elapsed())
    }

    /// Получены не все результаты
    #[inline]
    pub fn timed_out(&self) -> bool {
        self.results.len() < self.num
    }

    #[inline]
    pub fn num(&self) -> usize {
        self.num
    }

    #[inline]
    pub fn results(&self) -> &[T] {
        &self.results
    }

    pub fn into_results(self) -> Vec<T> {
        self.results
    }

    #[inline]
    pub fn op_times(&self) -> &StatsAccumulator {
        &self.op_times
    }

    /// Длительность пакета (до текущего момента, если пакет ещё не закрыт)
    pub fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }
}

/// Пул, который выполняет пакет задач и забирает только то, что успело за лимит.
///
/// Задачи, не успевшие к сроку, прерываются. `None` от задачи не считается результатом.
pub struct TimeLimitedPool {
    id: String,
    workers: Arc<Semaphore>,
}

impl TimeLimitedPool {
    pub fn new(id: impl Into<String>, num_workers: usize) -> Self {
        Self {
            id: id.into(),
            workers: Arc::new(Semaphore::new(num_workers.max(1))),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn execute<T, Fut>(&self, jobs: Vec<Fut>, time_limit: Duration) -> ExecutionInfo<T>
    where
        T: Send + 'static,
        Fut: Future<Output = Option<T>> + Send + 'static,
    {
        let mut info = ExecutionInfo::new(time_limit, jobs.len());
        let deadline = info.started + time_limit;

        let handles: Vec<JoinHandle<Option<T>>> = jobs
            .into_iter()
            .map(|job| {
                let workers = Arc::clone(&self.workers);
                tokio::spawn(async move {
                    let _permit = workers.acquire_owned().await.ok()?;
                    job.await
                })
            })
            .collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let mut pending = FuturesUnordered::from_iter(handles);

        loop {
            let next = tokio::select! {
                next = pending.next() => next,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match next {
                Some(Ok(Some(result))) => {
                    if !info.add_result(result) {
                        break;
                    }
                }
                Some(Ok(None)) => {}
                Some(Err(err)) => debug!(pool = %self.id, error = %err, "time-limited job failed"),
                None => break,
            }
        }

        for abort in aborts {
            abort.abort();
        }
        info.close();

        debug!(
            pool = %self.id,
            collected = info.results.len(),
            num = info.num,
            timed_out = info.timed_out(),
            elapsed_ms = info.elapsed().as_millis() as u64,
            "time-limited batch finished"
        );
        info
    }
}
