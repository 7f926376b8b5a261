use super::errors::QueueError;
use super::work::{
    KeyedWork,
    RequestKind,
    WaitHint,
    WorkRequest,
    WorkResponse,
    WorkSource,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::debug;


#[derive(Default)]
struct QueueState {
    items: VecDeque<KeyedWork>,
    last_key: u64,
    closed: bool,
}

/// Локальный источник работы поверх очереди в памяти.
///
/// Пустая открытая очередь отвечает WAITING, пустая закрытая — DONE.
pub struct QueueWorkSource {
    name: String,
    state: Mutex<QueueState>,
    wait_hint: WaitHint,
}

impl QueueWorkSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            wait_hint: WaitHint::default(),
        }
    }

    pub fn with_wait_hint(mut self, hint: WaitHint) -> Self {
        self.wait_hint = hint;
        self
    }

    /// Очередь из готовых нагрузок, ключи 1..=n
    pub fn from_payloads<I, P>(name: impl Into<String>, payloads: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let source = Self::new(name);
        for payload in payloads {
            if source.push_back(None, payload).is_err() {
                break;
            }
        }
        source
    }

    /// Возвращает присвоенный ключ.
    ///
    /// Без ключа берётся следующий за наибольшим; после `u64::MAX` ключей нет.
    pub fn push_back(&self, key: Option<u64>, payload: impl Into<Vec<u8>>) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        let key = Self::assign_key(&mut state, key)?;
        state.items.push_back(KeyedWork::keyed(key, payload));
        Ok(key)
    }

    pub fn push_front(&self, key: Option<u64>, payload: impl Into<Vec<u8>>) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        let key = Self::assign_key(&mut state, key)?;
        state.items.push_front(KeyedWork::keyed(key, payload));
        Ok(key)
    }

    fn assign_key(state: &mut QueueState, key: Option<u64>) -> Result<u64, QueueError> {
        let key = match key {
            Some(key) => key,
            None => state
                .last_key
                .checked_add(1)
                .ok_or(QueueError::KeysExhausted { last: state.last_key })?,
        };
        state.last_key = state.last_key.max(key);
        Ok(key)
    }

    /// Больше работы не будет: после опустошения отвечаем DONE
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    fn handle(&self, request: &WorkRequest) -> WorkResponse {
        let mut state = self.state.lock();

        match request.kind() {
            RequestKind::AddLast | RequestKind::AddFirst => {
                let Some(payload) = request.payload() else {
                    return WorkResponse::error("missing payload");
                };
                let key = match Self::assign_key(&mut state, request.key()) {
                    Ok(key) => key,
                    Err(err) => return WorkResponse::error(err.to_string()),
                };
                let work = KeyedWork::keyed(key, payload);
                if *request.kind() == RequestKind::AddFirst {
                    state.items.push_front(work);
                } else {
                    state.items.push_back(work);
                }
                WorkResponse::ok()
            }
            RequestKind::Get => match state.items.pop_front() {
                Some(work) => WorkResponse::work(work),
                None => self.empty_response(&state),
            },
            RequestKind::Peek => match state.items.front() {
                Some(work) => WorkResponse::work(work.clone()),
                None => self.empty_response(&state),
            },
            RequestKind::Find => {
                let Some(key) = request.key() else {
                    return WorkResponse::error("find requires a key");
                };
                match state.items.iter().find(|work| work.key() == Some(key)) {
                    Some(work) => WorkResponse::work(work.clone()),
                    None => WorkResponse::error(format!("no work with key {}", key)),
                }
            }
            RequestKind::Delete => {
                let Some(key) = request.key() else {
                    return WorkResponse::error("delete requires a key");
                };
                state.items.retain(|work| work.key() != Some(key));
                WorkResponse::ok()
            }
            RequestKind::Other(name) => WorkResponse::error(format!("unsupported request '{}'", name)),
        }
    }

    fn empty_response(&self, state: &QueueState) -> WorkResponse {
        if state.closed {
            WorkResponse::done()
        } else {
            WorkResponse::waiting_with(self.wait_hint)
        }
    }
}

#[async_trait]
impl WorkSource for QueueWorkSource {
    async fn get_work(&self, request: WorkRequest, _cancel: &CancellationToken) -> Option<WorkResponse> {
        let response = self.handle(&request).from_node(self.name.clone());
        debug!(queue = %self.name, kind = ?request.kind(), status = %response.status(), "queue request");
        Some(response)
    }

    fn describe(&self) -> String {
        format!("queue:{}", self.name)
    }
}
