use super::task::Task;
use std::fmt;
use thiserror::Error;


/// Ошибка выполнения задачи внутри пула
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(String),
    #[error("task panicked: {0}")]
    Panic(String),
    #[error("blocking task join failed: {0}")]
    JoinFailed(String),
}

/// Почему пул отказался принять задачу
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RejectReason {
    #[error("pool is not accepting work")]
    NotAccepting,
    #[error("pool has been shut down")]
    ShutDown,
    #[error("timed out waiting for room in the queue")]
    Timeout,
}

/// Отказ в приёме: задача возвращается вызывающему
#[derive(Error)]
#[error("{reason}: {}", .task.label())]
pub struct Rejected {
    pub task: Task,
    pub reason: RejectReason,
}

impl Rejected {
    pub fn into_task(self) -> Task {
        self.task
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("task", &self.task.label())
            .field("reason", &self.reason)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {node} failed: {message}")]
    Connection { node: String, message: String },
    #[error("unexpected response from {node}: {message}")]
    UnexpectedResponse { node: String, message: String },
}

/// Ошибки локальной очереди работы
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum QueueError {
    #[error("no keys left after {last}")]
    KeysExhausted { last: u64 },
}

#[derive(Debug, Error)]
pub enum FailureLogError {
    #[error("failure log i/o: {0}")]
    Io(#[from] std::io::Error),
}
