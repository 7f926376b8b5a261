use super::{
    errors::TransportError,
    work::{
        NodeId,
        WorkRequest,
        WorkResponse,
        WorkSource,
        WorkStatus,
    },
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Попыток на одного кандидата
    pub retries: u32,
    /// Таймаут одной попытки
    pub timeout: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Логический адресат: задание и группа узлов (или отдельный узел)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub job: String,
    pub target: String,
}

impl Destination {
    pub fn new(job: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            target: target.into(),
        }
    }
}

/// Кто спрашивает: свой узел и группа, в которой он состоит
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub node: NodeId,
    pub group: String,
}

impl Requester {
    pub fn new(node: impl Into<NodeId>, group: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            group: group.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCommand {
    pub job: String,
    pub request: WorkRequest,
}

impl JobCommand {
    pub fn new(job: impl Into<String>, request: WorkRequest) -> Self {
        Self {
            job: job.into(),
            request,
        }
    }
}

/// Доставка команды конкретному узлу.
///
/// `Ok(None)` означает, что узел не ответил за `timeout`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send
    (
        &self,
        node: &str,
        command: &JobCommand,
        timeout: Duration,
    ) -> Result<Option<WorkResponse>, TransportError>;
}

pub trait CandidateResolver: Send + Sync {
    fn list_candidates(&self, group: &str) -> Vec<NodeId>;
}

/// Группы узлов, заданные заранее
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    groups: HashMap<String, Vec<NodeId>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group<I, N>(mut self, group: impl Into<String>, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        self.insert(group, nodes);
        self
    }

    pub fn insert<I, N>(&mut self, group: impl Into<String>, nodes: I)
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        self.groups.insert(group.into(), nodes.into_iter().map(Into::into).collect());
    }
}

impl CandidateResolver for StaticResolver {
    fn list_candidates(&self, group: &str) -> Vec<NodeId> {
        self.groups.get(group).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationMode {
    /// Единственный адресат, ротации нет
    Fixed,
    /// Держимся одного сервера, пока он отвечает
    Sticky,
    /// Клиентов меньше, чем серверов: каждый вызов начинается со следующего
    AlwaysRotate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub candidates: Vec<NodeId>,
    pub mode: RotationMode,
}

struct RotationState {
    candidates: VecDeque<NodeId>,
    disabled: Vec<NodeId>,
}

enum Attempt {
    Response(WorkResponse),
    NoResponse,
    Cancelled,
}

/// Выбор живого сервера среди кандидатов логического адресата.
///
/// Узел, не ответивший ни на одну из попыток, отключается до конца жизни экземпляра.
/// Обратно он не включается: это решает оператор, см. [`disabled`](Self::disabled).
pub struct ServerRotation {
    description: String,
    destination: Destination,
    transport: Arc<dyn Transport>,
    config: RotationConfig,
    mode: RotationMode,
    state: tokio::sync::Mutex<RotationState>,
    preferred: Mutex<NodeId>,
}

impl ServerRotation {
    /// Упорядочить кандидатов для данного клиента.
    ///
    /// Клиенты одной группы начинают с разных серверов: смещение равно
    /// позиции клиента в своей группе по модулю числа серверов.
    pub fn resolve
    (
        destination: &Destination,
        requester: &Requester,
        resolver: &dyn CandidateResolver,
    ) -> Resolution {
        let mut servers: Vec<NodeId> = Vec::new();
        for node in resolver.list_candidates(&destination.target) {
            if !servers.contains(&node) {
                servers.push(node);
            }
        }

        match servers.len() {
            0 => Resolution {
                candidates: vec![destination.target.clone()],
                mode: RotationMode::Fixed,
            },
            1 => Resolution {
                candidates: servers,
                mode: RotationMode::Fixed,
            },
            n => {
                let clients = resolver.list_candidates(&requester.group);
                let start = clients
                    .iter()
                    .position(|node| *node == requester.node)
                    .unwrap_or(0)
                    % n;
                let candidates = (0..n).map(|i| servers[(start + i) % n].clone()).collect();
                let mode = if clients.len() < n {
                    RotationMode::AlwaysRotate
                } else {
                    RotationMode::Sticky
                };
                Resolution { candidates, mode }
            }
        }
    }

    pub fn new
    (
        description: impl Into<String>,
        destination: Destination,
        requester: &Requester,
        resolver: &dyn CandidateResolver,
        transport: Arc<dyn Transport>,
        config: RotationConfig,
    ) -> Self {
        let description = description.into();
        let Resolution { candidates, mode } = Self::resolve(&destination, requester, resolver);
        let preferred = candidates
            .first()
            .cloned()
            .unwrap_or_else(|| destination.target.clone());

        info!(
            rotation = %description,
            requester = %requester.node,
            node = %preferred,
            candidates = candidates.len(),
            ?mode,
            "initial server selected"
        );

        Self {
            description,
            destination,
            transport,
            config,
            mode,
            state: tokio::sync::Mutex::new(RotationState {
                candidates: candidates.into(),
                disabled: Vec::new(),
            }),
            preferred: Mutex::new(preferred),
        }
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[inline]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[inline]
    pub fn mode(&self) -> RotationMode {
        self.mode
    }

    /// Последний узел, давший настоящий ответ (не WAITING и не DONE)
    pub fn current_preferred(&self) -> NodeId {
        self.preferred.lock().clone()
    }

    /// Активные кандидаты в текущем порядке
    pub async fn candidates(&self) -> Vec<NodeId> {
        self.state.lock().await.candidates.iter().cloned().collect()
    }

    pub async fn disabled(&self) -> Vec<NodeId> {
        self.state.lock().await.disabled.clone()
    }

    /// Отправить команду, перебирая кандидатов.
    ///
    /// Возвращает настоящий ответ, иначе WAITING, иначе DONE, иначе `None`.
    pub async fn dispatch(&self, command: &JobCommand, cancel: &CancellationToken) -> Option<WorkResponse> {
        // параллельные вызовы выстраиваются здесь
        let mut state = self.state.lock().await;

        if self.mode == RotationMode::Fixed {
            let node = state.candidates.front().cloned()?;
            return match self.send_with_retries(&node, command, cancel).await {
                Attempt::Response(response) => {
                    if !is_pending(&response) {
                        *self.preferred.lock() = node;
                    }
                    Some(response)
                }
                Attempt::NoResponse | Attempt::Cancelled => None,
            };
        }

        let mut waiting: Option<WorkResponse> = None;
        let mut done: Option<WorkResponse> = None;
        let passes = state.candidates.len();

        for pass in 0..passes {
            if cancel.is_cancelled() {
                break;
            }
            let Some(node) = state.candidates.front().cloned() else {
                break;
            };
            if pass > 0 {
                info!(rotation = %self.description, %node, "rolling over to next server");
            }

            match self.send_with_retries(&node, command, cancel).await {
                Attempt::Cancelled => break,
                Attempt::NoResponse => {
                    state.candidates.pop_front();
                    state.disabled.push(node.clone());
                    warn!(
                        rotation = %self.description,
                        %node,
                        remaining = state.candidates.len(),
                        active = ?state.candidates,
                        "disabling non-responsive server node"
                    );
                }
                Attempt::Response(response) => match response.status() {
                    WorkStatus::Waiting => {
                        state.candidates.rotate_left(1);
                        if done.as_ref().is_some_and(|d| d.node() == response.node()) {
                            done = None;
                        }
                        waiting = Some(response);
                    }
                    WorkStatus::Done => {
                        state.candidates.rotate_left(1);
                        waiting = None;
                        done = Some(response);
                    }
                    _ => {
                        if self.mode == RotationMode::AlwaysRotate {
                            state.candidates.rotate_left(1);
                        }
                        *self.preferred.lock() = node;
                        return Some(response);
                    }
                },
            }
        }

        if state.candidates.is_empty() {
            warn!(rotation = %self.description, disabled = ?state.disabled, "no active servers remain");
        }
        waiting.or(done)
    }

    async fn send_with_retries
    (
        &self,
        node: &str,
        command: &JobCommand,
        cancel: &CancellationToken,
    ) -> Attempt {
        let retries = self.config.retries.max(1);
        let timeout = self.config.timeout;

        for attempt in 1..=retries {
            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }

            let sent = tokio::select! {
                sent = tokio::time::timeout(timeout, self.transport.send(node, command, timeout)) => sent,
                _ = cancel.cancelled() => return Attempt::Cancelled,
            };

            match sent {
                Ok(Ok(Some(response))) => {
                    debug!(rotation = %self.description, node, status = %response.status(), "response received");
                    return Attempt::Response(response.from_node(node));
                }
                Ok(Ok(None)) | Err(_) => {
                    warn!(
                        rotation = %self.description,
                        node,
                        attempt,
                        retries,
                        timeout_ms = timeout.as_millis() as u64,
                        "no response from server"
                    );
                }
                Ok(Err(err)) => {
                    warn!(rotation = %self.description, node, attempt, retries, error = %err, "transport error");
                }
            }
        }
        Attempt::NoResponse
    }
}

fn is_pending(response: &WorkResponse) -> bool {
    matches!(response.status(), WorkStatus::Waiting | WorkStatus::Done)
}

/// Источник работы на удалённых серверах, доступных через ротацию
pub struct RemoteWorkSource {
    rotation: Arc<ServerRotation>,
}

impl RemoteWorkSource {
    pub fn new(rotation: Arc<ServerRotation>) -> Self {
        Self { rotation }
    }

    pub fn rotation(&self) -> &Arc<ServerRotation> {
        &self.rotation
    }
}

#[async_trait]
impl WorkSource for RemoteWorkSource {
    async fn get_work(&self, request: WorkRequest, cancel: &CancellationToken) -> Option<WorkResponse> {
        let command = JobCommand::new(self.rotation.destination().job.clone(), request);
        self.rotation.dispatch(&command, cancel).await
    }

    fn describe(&self) -> String {
        format!("remote:{}@{}", self.rotation.description(), self.rotation.current_preferred())
    }
}
