//! Ядро распределения заданий по кластеру
//!
//! # Features
//! - Пул воркеров фиксированного размера с ограниченной очередью приёма
//! - Хуки жизненного цикла задач, кооперативная отмена через `die`
//! - Автоостановка пула по порогу ошибок, мягкая и немедленная остановка
//! - Цикл раздачи работы из подключаемого источника с обратным давлением
//! - Ротация серверов с отключением неотвечающих узлов
//! - Метрики и строка состояния для мониторинга

pub mod dispatch;
pub mod errors;
pub mod failure_log;
pub mod handle;
pub mod limited;
pub mod model;
pub mod pool;
pub mod queue_source;
pub mod rotation;
pub mod stats;
pub mod task;
pub mod work;

pub use dispatch::{DispatchConfig, WorkDispatchLoop, WAIT_INTERVAL};
pub use errors::{FailureLogError, QueueError, RejectReason, Rejected, TaskError, TransportError};
pub use failure_log::{FailureLog, FileFailureLog, MemoryFailureLog};
pub use handle::RunningHandle;
pub use limited::{ExecutionInfo, TimeLimitedPool};
pub use model::{rate_string, time_string, PoolMetrics};
pub use pool::{BoundedWorkerPool, Config, WorkerPool};
pub use queue_source::QueueWorkSource;
pub use rotation::{
    CandidateResolver,
    Destination,
    JobCommand,
    RemoteWorkSource,
    Requester,
    Resolution,
    RotationConfig,
    RotationMode,
    ServerRotation,
    StaticResolver,
    Transport,
};
pub use stats::{StatsAccumulator, WindowedStats};
pub use task::{Task, TaskResult};
pub use work::{
    KeyedWork,
    NodeId,
    RequestKind,
    ResponsePayload,
    WaitHint,
    WorkFunction,
    WorkRequest,
    WorkResponse,
    WorkSource,
    WorkStatus,
};
