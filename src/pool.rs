use super::{
    errors::{RejectReason, Rejected, TaskError},
    handle::RunningHandle,
    model::{
        rate_string,
        time_string,
        PoolMetrics,
    },
    stats::{StatsAccumulator, WindowedStats},
    task::Task,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::SystemTime,
};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    task::AbortHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};


/// Сколько диспетчер ждёт задачу из очереди, прежде чем перепроверить состояние пула
const SHUTDOWN_LATENCY: Duration = Duration::from_millis(100);

/// Конфигурация пула
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub num_workers: usize,
    pub max_queue_size: usize,
    /// 0 = пул никогда не останавливается из-за ошибок
    pub max_errors: usize,
    pub stats_window: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            num_workers: num_cpus * 2, // Для I/O-bound задач
            max_queue_size: num_cpus * 20,
            max_errors: 0,
            stats_window: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            num_workers: num_cpus,
            max_queue_size: num_cpus * 10,
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            num_workers: num_cpus * 4,
            max_queue_size: num_cpus * 40,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn with_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }
}


pub type WorkerPool = Arc<BoundedWorkerPool>;

#[derive(Default)]
struct Registry {
    /// Выполняющиеся задачи
    running: HashMap<u64, RunningHandle>,
    /// Переданы воркеру, но ещё не стартовали
    handoff: HashMap<u64, Task>,
    workers: HashMap<u64, AbortHandle>,
}

struct OpTimes {
    total: StatsAccumulator,
    recent: WindowedStats,
}

/// Пул фиксированного размера с ограниченной очередью приёма.
///
/// Один диспетчер переносит задачи из очереди к свободным воркерам;
/// пул остановленный однажды не перезапускается.
pub struct BoundedWorkerPool {
    id: String,
    config: Config,
    queue: ArrayQueue<Task>,
    // приём и слив очереди не должны пересекаться с остановкой
    admission: Mutex<()>,
    item_ready: Notify,
    space_ready: Notify,
    transfer_resumed: Notify,
    idle: Notify,
    workers: Arc<Semaphore>,
    registry: Mutex<Registry>,
    op_times: Mutex<OpTimes>,
    task_ids: AtomicU64,
    num_errors: AtomicUsize,
    stay_alive: AtomicBool,
    accepting_work: AtomicBool,
    transferring_work: AtomicBool,
    is_shutdown: AtomicBool,
    halt: CancellationToken,
    dispatcher_done: CancellationToken,
    started: Instant,
    started_at: SystemTime,
    stopped_at: Mutex<Option<SystemTime>>,
}

impl BoundedWorkerPool {
    pub fn new(id: impl Into<String>, config: Config) -> WorkerPool {
        let config = Config {
            num_workers: config.num_workers.max(1),
            max_queue_size: config.max_queue_size.max(1),
            ..config
        };

        let pool = Arc::new(BoundedWorkerPool {
            id: id.into(),
            queue: ArrayQueue::new(config.max_queue_size),
            admission: Mutex::new(()),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            transfer_resumed: Notify::new(),
            idle: Notify::new(),
            workers: Arc::new(Semaphore::new(config.num_workers)),
            registry: Mutex::new(Registry::default()),
            op_times: Mutex::new(OpTimes {
                total: StatsAccumulator::new(),
                recent: WindowedStats::new(config.stats_window),
            }),
            task_ids: AtomicU64::new(0),
            num_errors: AtomicUsize::new(0),
            stay_alive: AtomicBool::new(true),
            accepting_work: AtomicBool::new(true),
            transferring_work: AtomicBool::new(true),
            is_shutdown: AtomicBool::new(false),
            halt: CancellationToken::new(),
            dispatcher_done: CancellationToken::new(),
            started: Instant::now(),
            started_at: SystemTime::now(),
            stopped_at: Mutex::new(None),
            config,
        });

        info!(
            pool = %pool.id,
            workers = pool.config.num_workers,
            max_queue = pool.config.max_queue_size,
            max_errors = pool.config.max_errors,
            "worker pool started"
        );

        let dispatcher = pool.clone();
        tokio::spawn(async move {
            dispatcher.dispatch_loop().await;
        });

        pool
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    #[inline]
    pub fn max_queue_size(&self) -> usize {
        self.config.max_queue_size
    }

    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn running_count(&self) -> usize {
        self.registry.lock().running.len()
    }

    /// Выполняющиеся задачи, самые долгие первыми
    pub fn running(&self) -> Vec<RunningHandle> {
        let mut running: Vec<_> = self.registry.lock().running.values().cloned().collect();
        running.sort_by(|a, b| b.elapsed().cmp(&a.elapsed()));
        running
    }

    #[inline]
    pub fn num_errors(&self) -> usize {
        self.num_errors.load(Ordering::Acquire)
    }

    #[inline]
    pub fn max_errors(&self) -> usize {
        self.config.max_errors
    }

    pub fn num_run(&self) -> u64 {
        self.op_times.lock().total.n()
    }

    /// Статистика времени выполнения (мс) за всё время
    pub fn op_times(&self) -> StatsAccumulator {
        self.op_times.lock().total
    }

    /// Статистика времени выполнения (мс) за последнее окно
    pub fn recent_op_times(&self) -> StatsAccumulator {
        self.op_times.lock().recent.summary()
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.stay_alive.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    #[inline]
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// None, пока пул работает
    pub fn stopped_at(&self) -> Option<SystemTime> {
        *self.stopped_at.lock()
    }

    #[inline]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn stop_accepting_work(&self) {
        self.accepting_work.store(false, Ordering::Release);
    }

    pub fn resume_accepting_work(&self) {
        self.accepting_work.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_accepting_work(&self) -> bool {
        self.accepting_work.load(Ordering::Acquire)
    }

    pub fn stop_transferring_work(&self) {
        self.transferring_work.store(false, Ordering::Release);
    }

    pub fn resume_transferring_work(&self) {
        self.transferring_work.store(true, Ordering::Release);
        self.transfer_resumed.notify_waiters();
    }

    #[inline]
    pub fn is_transferring_work(&self) -> bool {
        self.transferring_work.load(Ordering::Acquire)
    }

    /// Нет ни очереди, ни выполняющихся, ни переданных задач
    pub fn is_idle(&self) -> bool {
        let registry = self.registry.lock();
        self.queue.is_empty() && registry.running.is_empty() && registry.handoff.is_empty()
    }

    fn admission_block(&self) -> Option<RejectReason> {
        if !self.is_up() {
            Some(RejectReason::ShutDown)
        } else if !self.is_accepting_work() {
            Some(RejectReason::NotAccepting)
        } else {
            None
        }
    }

    /// Поставить задачу в очередь, ожидая место не дольше `timeout`.
    ///
    /// При отказе задача возвращается внутри [`Rejected`].
    pub async fn submit(&self, task: Task, timeout: Duration) -> Result<(), Rejected> {
        let deadline = Instant::now() + timeout;
        let mut task = task;

        loop {
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let _gate = self.admission.lock();
                if let Some(reason) = self.admission_block() {
                    warn!(pool = %self.id, task = task.label(), %reason, "work rejected");
                    return Err(Rejected { task, reason });
                }
                match self.queue.push(task) {
                    Ok(()) => {
                        self.item_ready.notify_one();
                        return Ok(());
                    }
                    Err(back) => task = back,
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.halt.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(pool = %self.id, task = task.label(), timeout_ms = timeout.as_millis() as u64, "timed out offering work to queue");
                    return Err(Rejected { task, reason: RejectReason::Timeout });
                }
            }
        }
    }

    /// Забрать из очереди все задачи, ещё не переданные воркерам
    pub fn drain(&self) -> Vec<Task> {
        let _gate = self.admission.lock();
        self.drain_queue()
    }

    fn drain_queue(&self) -> Vec<Task> {
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(task) = self.queue.pop() {
            drained.push(task);
        }
        if !drained.is_empty() {
            self.space_ready.notify_waiters();
        }
        drained
    }

    /// Остановить пул.
    ///
    /// `immediate = false`: выполняющиеся задачи доработают, возвращается слитая очередь.
    /// `immediate = true`: всем задачам посылается `die`, воркеры прерываются,
    /// возвращаются и слитые, и переданные, но не стартовавшие задачи.
    /// Повторный вызов ничего не делает.
    pub async fn shutdown(&self, immediate: bool) -> Vec<Task> {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            info!(pool = %self.id, immediate, "shutdown ignored: already shut down");
            return Vec::new();
        }
        info!(pool = %self.id, immediate, "shutdown invoked");

        self.halt_pool();
        // диспетчер выходит в ближайшей точке ожидания
        self.dispatcher_done.cancelled().await;

        let mut reclaimed = {
            let _gate = self.admission.lock();
            self.drain_queue()
        };
        *self.stopped_at.lock() = Some(SystemTime::now());

        if immediate {
            let (unstarted, workers) = {
                let mut registry = self.registry.lock();
                for handle in registry.running.values() {
                    handle.kill();
                }
                let unstarted: Vec<Task> = registry.handoff.drain().map(|(_, task)| task).collect();
                let workers: Vec<AbortHandle> = registry.workers.drain().map(|(_, abort)| abort).collect();
                (unstarted, workers)
            };
            for worker in workers {
                worker.abort();
            }
            reclaimed.extend(unstarted);
            self.idle.notify_waiters();
        }

        if !reclaimed.is_empty() {
            info!(pool = %self.id, reclaimed = reclaimed.len(), "returning unexecuted tasks");
        }
        reclaimed
    }

    fn halt_pool(&self) {
        {
            let _gate = self.admission.lock();
            self.stay_alive.store(false, Ordering::Release);
        }
        self.halt.cancel();
        self.transfer_resumed.notify_waiters();
        self.space_ready.notify_waiters();
    }

    /// Ждать слот для приёма: в очереди есть место или свободен воркер
    pub async fn wait_for_available_slot
    (
        &self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.has_available_slot() {
                return true;
            }
            let now = Instant::now();
            if cancel.is_cancelled() || now >= deadline {
                return false;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until((now + poll_interval).min(deadline)) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }

    fn has_available_slot(&self) -> bool {
        !self.queue.is_full() || self.running_count() < self.config.num_workers
    }

    /// Ждать, пока очередь опустеет. true, если опустела до таймаута
    pub async fn wait_for_queue_to_empty(&self, timeout: Duration, poll_interval: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.space_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.queue.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until((now + poll_interval).min(deadline)) => {}
            }
        }
    }

    /// После shutdown: ждать выхода диспетчера и завершения всех задач
    pub async fn wait_until_done(&self, timeout: Duration) -> bool {
        let done = async {
            self.dispatcher_done.cancelled().await;
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let registry = self.registry.lock();
                    if registry.running.is_empty() && registry.handoff.is_empty() {
                        break;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, done).await.is_ok()
    }

    /// Ждать момента простоя не дольше `timeout`. true, если пул простаивает
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Послать `die` задаче, которая работает дольше всех
    pub fn kill_longest_running(&self) -> Option<RunningHandle> {
        let victim = self
            .registry
            .lock()
            .running
            .values()
            .filter(|handle| !handle.is_killed())
            .max_by_key(|handle| handle.elapsed())
            .cloned()?;
        victim.kill();
        Some(victim)
    }

    async fn dispatch_loop(self: Arc<Self>) {
        debug!(pool = %self.id, "dispatcher started");

        while self.is_up() {
            if !self.wait_for_item().await {
                break;
            }

            let permit = tokio::select! {
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.halt.cancelled() => break,
            };

            if !self.wait_for_transfer().await {
                break;
            }

            if let Some(id) = self.poll_queue(SHUTDOWN_LATENCY).await {
                self.hand_off(id, permit);
            }
        }

        debug!(pool = %self.id, "dispatcher stopped");
        self.dispatcher_done.cancel();
        self.idle.notify_waiters();
    }

    async fn wait_for_item(&self) -> bool {
        loop {
            if !self.is_up() {
                return false;
            }
            if !self.queue.is_empty() {
                return true;
            }
            tokio::select! {
                _ = self.item_ready.notified() => {}
                _ = self.halt.cancelled() => return false,
            }
        }
    }

    async fn wait_for_transfer(&self) -> bool {
        loop {
            let notified = self.transfer_resumed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_up() {
                return false;
            }
            if self.is_transferring_work() {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.halt.cancelled() => return false,
            }
        }
    }

    async fn poll_queue(&self, limit: Duration) -> Option<u64> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(id) = self.take_next() {
                self.space_ready.notify_waiters();
                return Some(id);
            }
            tokio::select! {
                _ = self.item_ready.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = self.halt.cancelled() => return None,
            }
        }
    }

    /// Снять задачу с очереди и сразу учесть как переданную, иначе is_idle увидит пустоту
    fn take_next(&self) -> Option<u64> {
        let mut registry = self.registry.lock();
        let task = self.queue.pop()?;
        let id = self.task_ids.fetch_add(1, Ordering::Relaxed) + 1;
        registry.handoff.insert(id, task);
        Some(id)
    }

    fn hand_off(self: &Arc<Self>, id: u64, permit: OwnedSemaphorePermit) {
        let mut registry = self.registry.lock();
        let pool = Arc::clone(self);
        let worker = tokio::spawn(async move {
            pool.run_worker(id, permit).await;
        });
        registry.workers.insert(id, worker.abort_handle());
    }

    async fn run_worker(&self, id: u64, permit: OwnedSemaphorePermit) {
        let (task, handle) = {
            let mut registry = self.registry.lock();
            let Some(task) = registry.handoff.remove(&id) else {
                // задачу уже забрал shutdown(true)
                registry.workers.remove(&id);
                return;
            };
            let handle = RunningHandle::new(id, task.label(), task.die_token());
            registry.running.insert(id, handle.clone());
            (task, handle)
        };

        let _guard = WorkerGuard {
            pool: self,
            id,
            started: Instant::now(),
            _permit: permit,
        };

        if let Err(err) = task.execute().await {
            self.record_error(&handle, &err);
        }
    }

    fn record_error(&self, handle: &RunningHandle, err: &TaskError) {
        let errors = self.num_errors.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(pool = %self.id, task = handle.label(), errors, error = %err, "task failed");

        let max_errors = self.config.max_errors;
        if max_errors > 0 && errors >= max_errors && self.is_up() {
            error!(pool = %self.id, errors, max_errors, "exceeded maximum errors, halting pool");
            self.halt_pool();
        }
    }

    fn finish_worker(&self, id: u64, started: Instant) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        {
            let mut op_times = self.op_times.lock();
            op_times.total.add(elapsed_ms);
            op_times.recent.add(elapsed_ms);
        }

        let now_idle = {
            let mut registry = self.registry.lock();
            registry.running.remove(&id);
            registry.workers.remove(&id);
            // очередь снимается под этой же блокировкой (take_next)
            self.queue.is_empty() && registry.running.is_empty() && registry.handoff.is_empty()
        };

        self.space_ready.notify_waiters();
        if now_idle || !self.is_up() {
            self.idle.notify_waiters();
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        let (op_times, recent_op_times) = {
            let mut op_times = self.op_times.lock();
            (op_times.total, op_times.recent.summary())
        };
        PoolMetrics {
            pool_id: self.id.clone(),
            num_workers: self.config.num_workers,
            running_tasks: self.running_count(),
            queued_tasks: self.queued(),
            max_queue_size: self.config.max_queue_size,
            num_run: op_times.n(),
            num_errors: self.num_errors(),
            max_errors: self.config.max_errors,
            is_up: self.is_up(),
            accepting_work: self.is_accepting_work(),
            transferring_work: self.is_transferring_work(),
            uptime: self.uptime(),
            op_times,
            recent_op_times,
        }
    }

    /// Строка состояния: аптайм, очередь, активные задачи, времена и скорость
    pub fn status(&self) -> String {
        let metrics = self.metrics();
        let ops = &metrics.op_times;
        format!(
            "upTime:{}  queued:{}  active:{}\n  runTime:{}  [n={},ave={},min={},max={}]  rate={}",
            time_string(metrics.uptime, true),
            metrics.queued_tasks,
            metrics.running_tasks,
            time_string(Duration::from_millis(ops.sum() as u64), true),
            ops.n(),
            time_string(Duration::from_millis((ops.mean() + 0.5) as u64), false),
            time_string(Duration::from_millis(ops.min() as u64), false),
            time_string(Duration::from_millis(ops.max() as u64), false),
            rate_string(metrics.rate()),
        )
    }

    /// Мониторинг метрик с callback
    /// ВАЖНО: Вызовите token.cancel() для остановки мониторинга и освобождения памяти
    pub fn start_monitoring<F>(self: &Arc<Self>, interval: Duration, callback: F) -> CancellationToken
    where
        F: Fn(PoolMetrics) + Send + 'static,
    {
        let pool = Arc::clone(self);
        let token = CancellationToken::new();
        let token_clone = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        callback(pool.metrics());
                    }
                    _ = token_clone.cancelled() => {
                        drop(pool);
                        break;
                    }
                }
            }
        });

        token
    }
}

/// Снимает воркер с учёта даже если его future был прерван
struct WorkerGuard<'a> {
    pool: &'a BoundedWorkerPool,
    id: u64,
    started: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        self.pool.finish_worker(self.id, self.started);
    }
}
