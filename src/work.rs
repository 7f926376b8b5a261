//! Единицы работы, запросы/ответы источника работы и подключаемые интерфейсы.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    future::Future,
    time::{Duration, SystemTime},
};
use tokio_util::sync::CancellationToken;


pub type NodeId = String;

/// Сколько байт полезной нагрузки показывать в описании
const DESCRIPTION_LIMIT: usize = 64;

/// Непрозрачная полезная нагрузка с необязательным ключом
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedWork {
    key: Option<u64>,
    payload: Vec<u8>,
}

impl KeyedWork {
    pub fn new(key: Option<u64>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            payload: payload.into(),
        }
    }

    pub fn keyed(key: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Some(key), payload)
    }

    #[inline]
    pub fn key(&self) -> Option<u64> {
        self.key
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Полезная нагрузка как текст (если это UTF-8)
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Display for KeyedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(key) = self.key {
            write!(f, "#{}:", key)?;
        }
        let shown = &self.payload[..self.payload.len().min(DESCRIPTION_LIMIT)];
        write!(f, "{}", String::from_utf8_lossy(shown))?;
        if self.payload.len() > DESCRIPTION_LIMIT {
            write!(f, "...")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    AddFirst,
    AddLast,
    Get,
    Peek,
    Find,
    Delete,
    Other(String),
}

/// Запрос к источнику работы. Не меняется после построения
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    kind: RequestKind,
    job_id: String,
    node_id: NodeId,
    key: Option<u64>,
    payload: Option<Vec<u8>>,
    timestamp: SystemTime,
}

impl WorkRequest {
    pub fn new(kind: RequestKind, job_id: impl Into<String>, node_id: impl Into<NodeId>) -> Self {
        Self {
            kind,
            job_id: job_id.into(),
            node_id: node_id.into(),
            key: None,
            payload: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn get(job_id: impl Into<String>, node_id: impl Into<NodeId>) -> Self {
        Self::new(RequestKind::Get, job_id, node_id)
    }

    pub fn with_key(mut self, key: u64) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[inline]
    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    #[inline]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[inline]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[inline]
    pub fn key(&self) -> Option<u64> {
        self.key
    }

    #[inline]
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    #[inline]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// Подсказка источника, как долго ждать следующей попытки
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitHint {
    pub retries: Option<u32>,
    pub sleep: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Work(KeyedWork),
    Waiting(WaitHint),
    Done,
    Down,
    Error(String),
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkStatus {
    Work,
    Waiting,
    Done,
    Down,
    Error,
    Ok,
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkStatus::Work => "WORK",
            WorkStatus::Waiting => "WAITING",
            WorkStatus::Done => "DONE",
            WorkStatus::Down => "DOWN",
            WorkStatus::Error => "ERROR",
            WorkStatus::Ok => "OK",
        };
        f.write_str(name)
    }
}

/// Ответ источника работы вместе с узлом, который его дал
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResponse {
    node: Option<NodeId>,
    payload: ResponsePayload,
}

impl WorkResponse {
    pub fn new(payload: ResponsePayload) -> Self {
        Self { node: None, payload }
    }

    pub fn work(work: KeyedWork) -> Self {
        Self::new(ResponsePayload::Work(work))
    }

    pub fn waiting() -> Self {
        Self::new(ResponsePayload::Waiting(WaitHint::default()))
    }

    pub fn waiting_with(hint: WaitHint) -> Self {
        Self::new(ResponsePayload::Waiting(hint))
    }

    pub fn done() -> Self {
        Self::new(ResponsePayload::Done)
    }

    pub fn down() -> Self {
        Self::new(ResponsePayload::Down)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponsePayload::Error(message.into()))
    }

    pub fn ok() -> Self {
        Self::new(ResponsePayload::Ok)
    }

    pub fn from_node(mut self, node: impl Into<NodeId>) -> Self {
        self.node = Some(node.into());
        self
    }

    #[inline]
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    #[inline]
    pub fn payload(&self) -> &ResponsePayload {
        &self.payload
    }

    pub fn into_payload(self) -> ResponsePayload {
        self.payload
    }

    pub fn status(&self) -> WorkStatus {
        match self.payload {
            ResponsePayload::Work(_) => WorkStatus::Work,
            ResponsePayload::Waiting(_) => WorkStatus::Waiting,
            ResponsePayload::Done => WorkStatus::Done,
            ResponsePayload::Down => WorkStatus::Down,
            ResponsePayload::Error(_) => WorkStatus::Error,
            ResponsePayload::Ok => WorkStatus::Ok,
        }
    }

    pub fn into_work(self) -> Option<KeyedWork> {
        match self.payload {
            ResponsePayload::Work(work) => Some(work),
            _ => None,
        }
    }
}

/// Откуда берётся работа: локальная очередь или удалённый сервер.
///
/// `None` означает, что источник недоступен.
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn get_work(&self, request: WorkRequest, cancel: &CancellationToken) -> Option<WorkResponse>;

    fn describe(&self) -> String {
        "work-source".to_string()
    }
}

/// Бизнес-логика одной единицы работы; `false` означает неудачу.
///
/// Долгая работа должна проверять `die` (сигнал убийства) и `pause`.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    async fn perform(&self, work: KeyedWork, die: CancellationToken, pause: CancellationToken) -> bool;

    fn status(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl<F, Fut> WorkFunction for F
where
    F: Fn(KeyedWork, CancellationToken, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    async fn perform(&self, work: KeyedWork, die: CancellationToken, pause: CancellationToken) -> bool {
        (self)(work, die, pause).await
    }
}
