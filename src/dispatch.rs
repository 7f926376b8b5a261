use super::{
    errors::{RejectReason, TaskError},
    failure_log::FailureLog,
    pool::{BoundedWorkerPool, Config, WorkerPool},
    task::Task,
    work::{
        KeyedWork,
        ResponsePayload,
        WaitHint,
        WorkFunction,
        WorkRequest,
        WorkResponse,
        WorkSource,
    },
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};


/// Интервал проверки свободного слота.
///
/// Ограничивает скорость, с которой работа попадает к воркерам.
pub const WAIT_INTERVAL: Duration = Duration::from_millis(10);

const SLOT_ATTEMPTS: usize = 3;
const SUBMIT_ATTEMPTS: usize = 3;
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Перепроверка после убийства задачи
const KILL_RECHECK: Duration = Duration::from_secs(1);
const SHUTDOWN_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_QUEUE_POLL: Duration = Duration::from_millis(50);
const SHUTDOWN_DONE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub pool: Config,
    pub job_id: String,
    pub node_id: String,
    /// Ожидание слота и приёма в очередь; задачи дольше этого убиваются. 0 = не убивать
    pub max_wait: Duration,
    /// Попытки достучаться до недоступного источника
    pub unreachable_retries: u32,
    /// Пауза после WAITING, если источник не подсказал свою
    pub waiting_sleep: Duration,
    /// Как часто писать в лог о продолжающемся ожидании
    pub waiting_report_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool: Config::default(),
            job_id: "job".to_string(),
            node_id: "local".to_string(),
            max_wait: Duration::from_secs(60),
            unreachable_retries: 3,
            waiting_sleep: Duration::from_millis(500),
            waiting_report_interval: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Default)]
struct WaitingState {
    total: Duration,
    retries: Option<u32>,
}

/// Цикл, который тянет работу из источника и кормит ею пул.
///
/// Один вызов [`pump_once`](Self::pump_once) — одна единица работы.
pub struct WorkDispatchLoop {
    id: String,
    config: DispatchConfig,
    pool: WorkerPool,
    source: Arc<dyn WorkSource>,
    worker: Arc<dyn WorkFunction>,
    failure_log: Arc<dyn FailureLog>,
    submitted: AtomicUsize,
    waiting: Mutex<WaitingState>,
}

impl WorkDispatchLoop {
    pub fn new
    (
        id: impl Into<String>,
        config: DispatchConfig,
        source: Arc<dyn WorkSource>,
        worker: Arc<dyn WorkFunction>,
        failure_log: Arc<dyn FailureLog>,
    ) -> Self {
        let id = id.into();
        let pool = BoundedWorkerPool::new(id.clone(), config.pool.clone());
        Self {
            id,
            config,
            pool,
            source,
            worker,
            failure_log,
            submitted: AtomicUsize::new(0),
            waiting: Mutex::new(WaitingState::default()),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.pool.is_up()
    }

    /// Сколько единиц работы принято пулом
    #[inline]
    pub fn num_submitted(&self) -> usize {
        self.submitted.load(Ordering::Acquire)
    }

    /// Описания выполняющихся единиц работы и их время работы
    pub fn running_work(&self) -> Vec<(Duration, String)> {
        self.pool
            .running()
            .into_iter()
            .map(|handle| (handle.elapsed(), handle.label().to_string()))
            .collect()
    }

    /// Качать, пока источник отдаёт работу или пока не придёт `cancel`
    pub async fn run(&self, cancel: &CancellationToken) -> usize {
        let mut pumped = 0;
        while !cancel.is_cancelled() && self.pump_once(cancel).await {
            pumped += 1;
        }
        pumped
    }

    /// Одна итерация: слот, запрос к источнику, разбор ответа.
    ///
    /// `false` означает, что качать дальше не нужно.
    pub async fn pump_once(&self, cancel: &CancellationToken) -> bool {
        if !self.pool.is_up() {
            return false;
        }
        if !self.wait_for_slot(cancel).await {
            // пул занят: попробуем на следующей итерации
            return !cancel.is_cancelled();
        }

        let Some(response) = self.request_work(cancel).await else {
            if !cancel.is_cancelled() {
                warn!(dispatch = %self.id, source = %self.source.describe(), "couldn't get work, quitting");
            }
            return false;
        };

        match response.into_payload() {
            ResponsePayload::Work(work) => {
                self.waiting.lock().total = Duration::ZERO;
                self.submit_work(work, cancel).await
            }
            ResponsePayload::Waiting(hint) => {
                self.wait_politely(hint, cancel).await;
                true
            }
            ResponsePayload::Done => {
                info!(dispatch = %self.id, source = %self.source.describe(), "got DONE from work source");
                false
            }
            ResponsePayload::Down => {
                warn!(dispatch = %self.id, source = %self.source.describe(), "work source is down");
                false
            }
            ResponsePayload::Error(message) => {
                error!(dispatch = %self.id, source = %self.source.describe(), %message, "work source error");
                false
            }
            ResponsePayload::Ok => true,
        }
    }

    async fn wait_for_slot(&self, cancel: &CancellationToken) -> bool {
        for _ in 0..SLOT_ATTEMPTS {
            if cancel.is_cancelled() {
                break;
            }
            if self.pool.wait_for_available_slot(self.config.max_wait, WAIT_INTERVAL, cancel).await {
                return true;
            }
        }
        false
    }

    async fn request_work(&self, cancel: &CancellationToken) -> Option<WorkResponse> {
        let retries = self
            .waiting
            .lock()
            .retries
            .unwrap_or(self.config.unreachable_retries)
            .max(1);

        for attempt in 1..=retries {
            if cancel.is_cancelled() {
                return None;
            }
            let request = WorkRequest::get(self.config.job_id.clone(), self.config.node_id.clone());
            if let Some(response) = self.source.get_work(request, cancel).await {
                return Some(response);
            }

            warn!(dispatch = %self.id, attempt, retries, "no response from work source");
            if attempt < retries && !sleep_or_cancel(self.config.waiting_sleep, cancel).await {
                return None;
            }
        }
        None
    }

    async fn wait_politely(&self, hint: WaitHint, cancel: &CancellationToken) {
        let sleep = hint.sleep.unwrap_or(self.config.waiting_sleep);

        let (total, report) = {
            let mut waiting = self.waiting.lock();
            if hint.retries.is_some() {
                waiting.retries = hint.retries;
            }
            waiting.total += sleep;

            // первый раз и затем раз в report_interval
            let report_ms = self.config.waiting_report_interval.as_millis();
            let report = report_ms == 0 || waiting.total.as_millis() % report_ms <= sleep.as_millis();
            (waiting.total, report)
        };

        if report {
            info!(
                dispatch = %self.id,
                sleep_ms = sleep.as_millis() as u64,
                total_waiting_ms = total.as_millis() as u64,
                "work source is WAITING"
            );
        }
        sleep_or_cancel(sleep, cancel).await;
    }

    async fn submit_work(&self, work: KeyedWork, cancel: &CancellationToken) -> bool {
        let description = work.to_string();
        let mut task = self.build_task(work, cancel);

        for attempt in 0..SUBMIT_ATTEMPTS {
            if cancel.is_cancelled() {
                task.reclaim();
                return false;
            }

            match self.pool.submit(task, self.config.max_wait).await {
                Ok(()) => {
                    self.submitted.fetch_add(1, Ordering::AcqRel);
                    return true;
                }
                Err(rejected) => {
                    let reason = rejected.reason;
                    task = rejected.into_task();

                    if reason == RejectReason::ShutDown {
                        break;
                    }
                    if attempt > 0 {
                        warn!(dispatch = %self.id, work = %description, attempt = attempt + 1, "timed out adding work to pool");
                    }
                    if attempt + 1 < SUBMIT_ATTEMPTS {
                        // перед последней попыткой освобождаем слот принудительно
                        if attempt + 2 == SUBMIT_ATTEMPTS {
                            self.pool.kill_longest_running();
                        }
                        if !sleep_or_cancel(SUBMIT_RETRY_DELAY, cancel).await {
                            task.reclaim();
                            return false;
                        }
                    }
                }
            }
        }

        error!(dispatch = %self.id, work = %description, "could not add work to pool, dropping it");
        self.record_failure(&description);
        false
    }

    fn build_task(&self, work: KeyedWork, pause: &CancellationToken) -> Task {
        let label = work.to_string();
        let worker = Arc::clone(&self.worker);
        let pause = pause.clone();
        let failure_log = Arc::clone(&self.failure_log);
        let dispatch_id = self.id.clone();
        let failed_label = label.clone();
        let reclaimed_label = label.clone();
        let reclaimed_id = self.id.clone();

        Task::new(label, move |die| async move {
            if worker.perform(work, die, pause).await {
                Ok(())
            } else {
                Err(TaskError::Failed("work function reported failure".to_string()))
            }
        })
        .on_error(move |err| {
            warn!(dispatch = %dispatch_id, work = %failed_label, error = %err, "work unit failed");
            if let Err(log_err) = failure_log.record(&failed_label) {
                error!(dispatch = %dispatch_id, error = %log_err, "failed to write failure log");
            }
        })
        .on_reclaim(move || {
            debug!(dispatch = %reclaimed_id, work = %reclaimed_label, "work unit reclaimed");
        })
    }

    fn record_failure(&self, description: &str) {
        if let Err(err) = self.failure_log.record(description) {
            error!(dispatch = %self.id, error = %err, "failed to write failure log");
        }
    }

    /// Ждать, пока не останется работающих задач.
    ///
    /// Задачи, работающие дольше `max_wait`, получают `die`.
    pub async fn wait_until_finished(&self, poll_interval: Duration) {
        let kill_after = (!self.config.max_wait.is_zero())
            .then(|| self.config.max_wait + Duration::from_millis(1));

        loop {
            let running = self.pool.running();
            if self.pool.is_idle() || (running.is_empty() && !self.pool.is_up()) {
                break;
            }

            let mut killed = false;
            if let Some(limit) = kill_after {
                for handle in running.iter().filter(|h| !h.is_killed() && h.elapsed() > limit) {
                    info!(
                        dispatch = %self.id,
                        work = handle.label(),
                        runtime_ms = handle.elapsed().as_millis() as u64,
                        limit_ms = limit.as_millis() as u64,
                        "killing long-running work"
                    );
                    handle.kill();
                    killed = true;
                }
            }

            let wait = if killed {
                KILL_RECHECK.min(poll_interval / 2)
            } else {
                poll_interval
            }
            .max(WAIT_INTERVAL);
            self.pool.wait_idle(wait).await;
        }
    }

    /// Остановить пул. Возвращает описания невыполненных единиц работы
    pub async fn shutdown(&self, immediate: bool) -> Vec<String> {
        let mut unexecuted = Vec::new();
        if !self.pool.is_shutdown() {
            info!(dispatch = %self.id, immediate, "shutting down work pool");

            let reclaimed = if immediate {
                self.pool.shutdown(true).await
            } else {
                self.pool.stop_accepting_work();
                self.pool.wait_for_queue_to_empty(SHUTDOWN_QUEUE_TIMEOUT, SHUTDOWN_QUEUE_POLL).await;
                let reclaimed = self.pool.shutdown(false).await;
                if !self.pool.wait_until_done(SHUTDOWN_DONE_TIMEOUT).await {
                    warn!(dispatch = %self.id, running = self.pool.running_count(), "work still running after shutdown timeout");
                }
                reclaimed
            };

            for task in reclaimed {
                unexecuted.push(task.label().to_string());
                task.reclaim();
            }
        }

        if let Err(err) = self.failure_log.flush() {
            error!(dispatch = %self.id, error = %err, "failed to flush failure log");
        }
        unexecuted
    }

    pub fn status(&self) -> String {
        let mut status = format!("{}  source={}", self.pool.status(), self.source.describe());
        if let Some(worker_status) = self.worker.status() {
            status.push_str("\n  ");
            status.push_str(&worker_status);
        }
        status
    }
}

/// false, если сон прервала отмена
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}
