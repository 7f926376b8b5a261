use super::errors::TaskError;
use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
};
use futures::{
    future::BoxFuture,
    FutureExt,
};
use tokio_util::sync::CancellationToken;


pub type TaskResult = Result<(), TaskError>;

type AsyncBody = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, TaskResult> + Send>;
type BlockingBody = Box<dyn FnOnce(CancellationToken) -> TaskResult + Send>;
type Hook = Box<dyn FnOnce() + Send>;
type ErrorHook = Box<dyn FnOnce(&TaskError) + Send>;

enum Body {
    Async(AsyncBody),
    Blocking(BlockingBody),
}

/// Хуки жизненного цикла задачи
#[derive(Default)]
pub struct TaskHooks {
    before: Option<Hook>,
    after: Option<Hook>,
    on_error: Option<ErrorHook>,
    on_reclaim: Option<Hook>,
}

/// Единица работы, принятая пулом.
///
/// Тело получает токен `die`: пул не может вытеснить работающую задачу,
/// поэтому долгие тела обязаны периодически проверять его сами.
pub struct Task {
    label: String,
    body: Body,
    hooks: TaskHooks,
    die: CancellationToken,
}

impl Task {
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self::with_body(label, Body::Async(Box::new(move |die| f(die).boxed())))
    }

    /// Тело выполняется через `spawn_blocking`
    pub fn blocking<F>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> TaskResult + Send + 'static,
    {
        Self::with_body(label, Body::Blocking(Box::new(f)))
    }

    fn with_body(label: impl Into<String>, body: Body) -> Self {
        Self {
            label: label.into(),
            body,
            hooks: TaskHooks::default(),
            die: CancellationToken::new(),
        }
    }

    pub fn before_run<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.before = Some(Box::new(hook));
        self
    }

    pub fn after_run<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.after = Some(Box::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        self.hooks.on_error = Some(Box::new(hook));
        self
    }

    /// Вызывается, когда невыполненная задача возвращается владельцу при остановке пула
    pub fn on_reclaim<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.on_reclaim = Some(Box::new(hook));
        self
    }

    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn die_token(&self) -> CancellationToken {
        self.die.clone()
    }

    #[inline]
    pub fn die(&self) {
        self.die.cancel();
    }

    pub fn reclaim(mut self) {
        if let Some(hook) = self.hooks.on_reclaim.take() {
            hook();
        }
    }

    /// before -> тело -> after; любая ошибка или паника уходит в on_error
    pub(crate) async fn execute(self) -> TaskResult {
        let Task { body, mut hooks, die, .. } = self;

        let mut outcome = run_hook(hooks.before.take());
        if outcome.is_ok() {
            outcome = run_body(body, die).await;
        }
        if outcome.is_ok() {
            outcome = run_hook(hooks.after.take());
        }

        if let Err(err) = &outcome {
            if let Some(hook) = hooks.on_error.take() {
                // паника в обработчике ошибки не должна уронить воркер
                let _ = std::panic::catch_unwind(AssertUnwindSafe(|| hook(err)));
            }
        }
        outcome
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.label)
            .field("killed", &self.die.is_cancelled())
            .finish()
    }
}

fn run_hook(hook: Option<Hook>) -> TaskResult {
    match hook {
        Some(hook) => std::panic::catch_unwind(AssertUnwindSafe(hook))
            .map_err(|panic_info| TaskError::Panic(panic_message(panic_info))),
        None => Ok(()),
    }
}

async fn run_body(body: Body, die: CancellationToken) -> TaskResult {
    match body {
        Body::Async(f) => AssertUnwindSafe(async move { f(die).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic_info| Err(TaskError::Panic(panic_message(panic_info)))),
        Body::Blocking(f) => {
            let joined = tokio::task::spawn_blocking(move || {
                std::panic::catch_unwind(AssertUnwindSafe(|| f(die)))
            })
            .await;
            match joined {
                Ok(Ok(result)) => result,
                Ok(Err(panic_info)) => Err(TaskError::Panic(panic_message(panic_info))),
                Err(join_err) => Err(TaskError::JoinFailed(join_err.to_string())),
            }
        }
    }
}

pub(crate) fn panic_message(panic_info: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic_info.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic_info.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
