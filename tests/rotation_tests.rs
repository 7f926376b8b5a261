#[cfg(test)]
mod tests {
    use async_cluster::{
        dispatch::{DispatchConfig, WorkDispatchLoop},
        errors::TransportError,
        failure_log::MemoryFailureLog,
        rotation::{
            CandidateResolver,
            Destination,
            JobCommand,
            RemoteWorkSource,
            Requester,
            RotationConfig,
            RotationMode,
            ServerRotation,
            StaticResolver,
            Transport,
        },
        work::{
            KeyedWork,
            RequestKind,
            WorkRequest,
            WorkResponse,
            WorkSource,
            WorkStatus,
        },
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Arc,
    };
    use tokio::time::{Duration, Instant};
    use tokio_util::sync::CancellationToken;

    #[derive(Clone)]
    enum Reply {
        Respond(WorkResponse),
        /// Узел молчит: транспорт сам сообщает об отсутствии ответа
        Silent,
        /// Ошибка соединения
        Fail,
        /// Узел висит дольше таймаута
        Hang,
    }

    /// Транспорт со сценарием ответов для каждого узла
    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        defaults: Mutex<HashMap<String, Reply>>,
        sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn script(&self, node: &str, replies: Vec<Reply>) {
            self.scripts.lock().insert(node.to_string(), replies.into());
        }

        fn always(&self, node: &str, reply: Reply) {
            self.defaults.lock().insert(node.to_string(), reply);
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }

        fn clear_sent(&self) {
            self.sent.lock().clear();
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send
        (
            &self,
            node: &str,
            command: &JobCommand,
            _timeout: Duration,
        ) -> Result<Option<WorkResponse>, TransportError> {
            assert_eq!(command.job, "crawl");
            self.sent.lock().push(node.to_string());

            let scripted = self.scripts.lock().get_mut(node).and_then(VecDeque::pop_front);
            let reply = scripted
                .or_else(|| self.defaults.lock().get(node).cloned())
                .unwrap_or_else(|| Reply::Respond(WorkResponse::work(KeyedWork::keyed(1, node))));

            match reply {
                Reply::Respond(response) => Ok(Some(response)),
                Reply::Silent => Ok(None),
                Reply::Fail => Err(TransportError::Connection {
                    node: node.to_string(),
                    message: "connection refused".to_string(),
                }),
                Reply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(None)
                }
            }
        }
    }

    fn nodes(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    fn cluster(servers: usize, clients: usize) -> StaticResolver {
        StaticResolver::new()
            .with_group("servers", nodes("s", servers))
            .with_group("clients", nodes("c", clients))
    }

    fn destination() -> Destination {
        Destination::new("crawl", "servers")
    }

    fn fast_config() -> RotationConfig {
        RotationConfig {
            retries: 2,
            timeout: Duration::from_millis(20),
        }
    }

    fn make_rotation
    (
        client: usize,
        resolver: &dyn CandidateResolver,
        transport: Arc<ScriptedTransport>,
    ) -> ServerRotation {
        ServerRotation::new(
            format!("test-c{}", client),
            destination(),
            &Requester::new(format!("c{}", client), "clients"),
            resolver,
            transport,
            fast_config(),
        )
    }

    fn get() -> JobCommand {
        JobCommand::new("crawl", WorkRequest::get("crawl", "c0"))
    }

    #[test]
    fn test_rotation_fairness() {
        println!("\n=== TEST: Равномерное распределение клиентов ===");
        for clients in [6usize, 7] {
            let resolver = cluster(3, clients);
            let mut preferred: HashMap<String, usize> = HashMap::new();
            for c in 0..clients {
                let resolution = ServerRotation::resolve(
                    &destination(),
                    &Requester::new(format!("c{}", c), "clients"),
                    &resolver,
                );
                assert_eq!(resolution.mode, RotationMode::Sticky);
                assert_eq!(resolution.candidates.len(), 3);
                *preferred.entry(resolution.candidates[0].clone()).or_default() += 1;
            }

            let (low, high) = (clients / 3, (clients + 2) / 3);
            println!("  M={}: {:?}", clients, preferred);
            assert_eq!(preferred.len(), 3);
            for count in preferred.values() {
                assert!(*count >= low && *count <= high, "Неравномерно: {:?}", preferred);
            }
        }
        println!("  ✓ Каждый сервер получил ⌊M/N⌋ или ⌈M/N⌉ клиентов");
    }

    #[test]
    fn test_resolve_modes() {
        println!("\n=== TEST: Режимы ротации ===");
        let requester = Requester::new("c1", "clients");

        let none = StaticResolver::new();
        let resolution = ServerRotation::resolve(&destination(), &requester, &none);
        assert_eq!(resolution.mode, RotationMode::Fixed);
        assert_eq!(resolution.candidates, vec!["servers".to_string()]);

        let single = StaticResolver::new().with_group("servers", ["only"]);
        let resolution = ServerRotation::resolve(&destination(), &requester, &single);
        assert_eq!(resolution.mode, RotationMode::Fixed);
        assert_eq!(resolution.candidates, vec!["only".to_string()]);

        let few_clients = cluster(3, 2);
        let resolution = ServerRotation::resolve(&destination(), &requester, &few_clients);
        assert_eq!(resolution.mode, RotationMode::AlwaysRotate);
        assert_eq!(resolution.candidates, vec!["s1", "s2", "s0"]);

        let duplicated = StaticResolver::new()
            .with_group("servers", ["a", "b", "a"])
            .with_group("clients", ["x", "y", "z"]);
        let stranger = Requester::new("nobody", "clients");
        let resolution = ServerRotation::resolve(&destination(), &stranger, &duplicated);
        assert_eq!(resolution.candidates, vec!["a", "b"], "Дубликаты убраны, чужой клиент начинает с 0");
        println!("  ✓ Fixed / AlwaysRotate / Sticky");
    }

    #[tokio::test]
    async fn test_always_rotate_and_sticky() {
        println!("\n=== TEST: AlwaysRotate против Sticky ===");
        let cancel = CancellationToken::new();

        let transport = ScriptedTransport::new();
        let rotating = make_rotation(0, &cluster(3, 2), transport.clone());
        assert_eq!(rotating.mode(), RotationMode::AlwaysRotate);
        let mut served = Vec::new();
        for _ in 0..4 {
            let response = rotating.dispatch(&get(), &cancel).await.unwrap();
            assert_eq!(response.status(), WorkStatus::Work);
            served.push(response.node().unwrap().to_string());
            assert_eq!(rotating.current_preferred(), served[served.len() - 1]);
        }
        println!("  AlwaysRotate: {:?}", served);
        assert_eq!(served, vec!["s0", "s1", "s2", "s0"]);

        let transport = ScriptedTransport::new();
        let sticky = make_rotation(1, &cluster(3, 3), transport.clone());
        assert_eq!(sticky.mode(), RotationMode::Sticky);
        for _ in 0..3 {
            let response = sticky.dispatch(&get(), &cancel).await.unwrap();
            assert_eq!(response.node(), Some("s1"));
        }
        assert_eq!(transport.sent(), vec!["s1", "s1", "s1"]);
        println!("  ✓ Sticky держится за s1");
    }

    #[tokio::test]
    async fn test_failover_disables_silent_node() {
        println!("\n=== TEST: Переключение и отключение молчащего узла ===");
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new();
        transport.always("s0", Reply::Silent);
        let rotation = make_rotation(0, &cluster(3, 3), transport.clone());

        let response = rotation.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(response.node(), Some("s1"));
        assert_eq!(transport.sent(), vec!["s0", "s0", "s1"], "Две попытки к s0, затем s1");
        assert_eq!(rotation.disabled().await, vec!["s0".to_string()]);
        assert_eq!(rotation.candidates().await, vec!["s1", "s2"]);
        assert_eq!(rotation.current_preferred(), "s1");

        transport.clear_sent();
        for _ in 0..3 {
            rotation.dispatch(&get(), &cancel).await.unwrap();
        }
        assert!(!transport.sent().contains(&"s0".to_string()), "Отключённый узел больше не опрашивается");
        println!("  ✓ s0 отключён навсегда");
    }

    #[tokio::test]
    async fn test_failover_on_timeout_and_transport_error() {
        println!("\n=== TEST: Таймаут и ошибка соединения ===");
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new();
        transport.always("s0", Reply::Hang);
        transport.always("s1", Reply::Fail);
        let rotation = make_rotation(0, &cluster(3, 3), transport.clone());

        let started = Instant::now();
        let response = rotation.dispatch(&get(), &cancel).await.unwrap();
        println!("  Ответ от {:?} за {:?}", response.node(), started.elapsed());
        assert_eq!(response.node(), Some("s2"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(rotation.disabled().await, vec!["s0".to_string(), "s1".to_string()]);
        assert_eq!(rotation.candidates().await, vec!["s2"]);
        println!("  ✓ Оба узла отключены");
    }

    #[tokio::test]
    async fn test_status_precedence() {
        println!("\n=== TEST: Приоритет статусов ===");
        let cancel = CancellationToken::new();

        // WAITING от s0, затем DONE от s1: побеждает DONE
        let transport = ScriptedTransport::new();
        transport.always("s0", Reply::Respond(WorkResponse::waiting()));
        transport.always("s1", Reply::Respond(WorkResponse::done()));
        let rotation_a = make_rotation(0, &cluster(2, 2), transport.clone());
        let response = rotation_a.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(response.status(), WorkStatus::Done);
        assert_eq!(response.node(), Some("s1"));
        assert!(rotation_a.disabled().await.is_empty(), "WAITING и DONE не отключают узлы");
        println!("  ✓ WAITING(s0) -> DONE(s1) = DONE");

        // DONE от s0, затем WAITING от s1: остаётся WAITING
        let transport = ScriptedTransport::new();
        transport.always("s0", Reply::Respond(WorkResponse::done()));
        transport.always("s1", Reply::Respond(WorkResponse::waiting()));
        let rotation_b = make_rotation(0, &cluster(2, 2), transport.clone());
        let response = rotation_b.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(response.status(), WorkStatus::Waiting);
        assert_eq!(response.node(), Some("s1"));
        println!("  ✓ DONE(s0) -> WAITING(s1) = WAITING");

        // s0 сначала DONE, на следующем проходе WAITING: новый статус вытесняет старый
        let transport = ScriptedTransport::new();
        transport.script("s0", vec![
            Reply::Respond(WorkResponse::done()),
            Reply::Respond(WorkResponse::waiting()),
        ]);
        transport.always("s1", Reply::Respond(WorkResponse::done()));
        let rotation_c = make_rotation(0, &cluster(2, 2), transport.clone());
        let first = rotation_c.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(first.status(), WorkStatus::Done);
        let second = rotation_c.dispatch(&get(), &cancel).await.unwrap();
        println!("  Второй проход: {} от {:?}", second.status(), second.node());
        assert!(transport.sent().ends_with(&["s0".to_string(), "s1".to_string()]));
        assert_eq!(second.status(), WorkStatus::Done, "DONE от s1 после WAITING от s0");

        transport.always("s1", Reply::Respond(WorkResponse::waiting()));
        transport.script("s0", vec![Reply::Respond(WorkResponse::waiting())]);
        let third = rotation_c.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(third.status(), WorkStatus::Waiting);
        println!("  ✓ WAITING вытесняет устаревший DONE");

        // настоящий ответ важнее любого WAITING
        let transport = ScriptedTransport::new();
        transport.always("s0", Reply::Respond(WorkResponse::waiting()));
        let rotation_d = make_rotation(0, &cluster(2, 2), transport.clone());
        let response = rotation_d.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(response.status(), WorkStatus::Work);
        assert_eq!(rotation_d.current_preferred(), "s1");
        assert_eq!(rotation_d.candidates().await, vec!["s1", "s0"]);
        println!("  ✓ WORK(s1) после WAITING(s0)");
    }

    #[tokio::test]
    async fn test_rotation_exhaustion() {
        println!("\n=== TEST: Все кандидаты недоступны ===");
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new();
        for node in nodes("s", 3) {
            transport.always(&node, Reply::Silent);
        }
        let rotation = make_rotation(0, &cluster(3, 3), transport.clone());

        assert!(rotation.dispatch(&get(), &cancel).await.is_none());
        assert_eq!(rotation.disabled().await.len(), 3);
        assert!(rotation.candidates().await.is_empty());
        assert_eq!(transport.sent().len(), 3 * 2);

        transport.clear_sent();
        assert!(rotation.dispatch(&get(), &cancel).await.is_none());
        assert!(transport.sent().is_empty(), "Опрашивать больше некого");

        // деградированный ответ, если кто-то успел сказать WAITING
        let transport = ScriptedTransport::new();
        transport.always("s0", Reply::Respond(WorkResponse::waiting()));
        transport.always("s1", Reply::Silent);
        let rotation = make_rotation(0, &cluster(2, 2), transport.clone());
        let response = rotation.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(response.status(), WorkStatus::Waiting);
        assert_eq!(rotation.candidates().await, vec!["s0"]);
        println!("  ✓ None, затем лучший из деградированных ответов");
    }

    #[tokio::test]
    async fn test_fixed_target_never_disabled() {
        println!("\n=== TEST: Единственный адресат не отключается ===");
        let cancel = CancellationToken::new();
        let transport = ScriptedTransport::new();
        transport.always("only", Reply::Silent);
        let resolver = StaticResolver::new().with_group("servers", ["only"]);
        let rotation = make_rotation(0, &resolver, transport.clone());
        assert_eq!(rotation.mode(), RotationMode::Fixed);

        assert!(rotation.dispatch(&get(), &cancel).await.is_none());
        assert_eq!(transport.sent().len(), 2);
        assert!(rotation.disabled().await.is_empty());

        transport.always("only", Reply::Respond(WorkResponse::done()));
        let response = rotation.dispatch(&get(), &cancel).await.unwrap();
        assert_eq!(response.status(), WorkStatus::Done);
        assert_eq!(response.node(), Some("only"));
        println!("  ✓ Готово");
    }

    #[tokio::test]
    async fn test_cancellation_does_not_disable() {
        println!("\n=== TEST: Отмена во время ротации ===");
        let transport = ScriptedTransport::new();
        transport.always("s0", Reply::Hang);
        let rotation = Arc::new(ServerRotation::new(
            "cancel",
            destination(),
            &Requester::new("c0", "clients"),
            &cluster(3, 3),
            transport.clone(),
            RotationConfig {
                retries: 3,
                timeout: Duration::from_secs(30),
            },
        ));

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        assert!(rotation.dispatch(&get(), &cancel).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(rotation.disabled().await.is_empty(), "Отмена не повод отключать узел");
        assert_eq!(rotation.candidates().await.len(), 3);

        assert!(rotation.dispatch(&get(), &cancel).await.is_none());
        assert_eq!(transport.sent().len(), 1);
        println!("  ✓ Готово");
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_serializes() {
        println!("\n=== TEST: Параллельные вызовы одной ротации ===");
        let transport = ScriptedTransport::new();
        let rotation = Arc::new(make_rotation(0, &cluster(3, 2), transport.clone()));
        let cancel = CancellationToken::new();

        let calls: Vec<_> = (0..6)
            .map(|_| {
                let rotation = rotation.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { rotation.dispatch(&get(), &cancel).await })
            })
            .collect();
        for call in calls {
            assert!(call.await.unwrap().is_some());
        }

        let mut per_node: HashMap<String, usize> = HashMap::new();
        for node in transport.sent() {
            *per_node.entry(node).or_default() += 1;
        }
        println!("  Запросы по узлам: {:?}", per_node);
        assert_eq!(per_node.values().copied().collect::<Vec<_>>(), vec![2, 2, 2]);
    }

    #[tokio::test]
    async fn test_remote_work_source_feeds_dispatch_loop() {
        println!("\n=== TEST: Удалённый источник в цикле раздачи ===");
        let transport = ScriptedTransport::new();
        transport.script("s0", vec![
            Reply::Respond(WorkResponse::work(KeyedWork::keyed(1, "page-1"))),
            Reply::Respond(WorkResponse::work(KeyedWork::keyed(2, "page-2"))),
        ]);
        transport.always("s0", Reply::Respond(WorkResponse::done()));
        transport.always("s1", Reply::Respond(WorkResponse::done()));

        let rotation = Arc::new(make_rotation(0, &cluster(2, 2), transport.clone()));
        let source = Arc::new(RemoteWorkSource::new(rotation.clone()));
        assert!(source.describe().starts_with("remote:test-c0@"));

        let cancel = CancellationToken::new();
        let peek = source
            .get_work(WorkRequest::new(RequestKind::Peek, "crawl", "c0"), &cancel)
            .await
            .unwrap();
        assert_eq!(peek.into_work().unwrap().as_text(), Some("page-1"));
        transport.script("s0", vec![
            Reply::Respond(WorkResponse::work(KeyedWork::keyed(1, "page-1"))),
            Reply::Respond(WorkResponse::work(KeyedWork::keyed(2, "page-2"))),
        ]);

        let performed = Arc::new(Mutex::new(Vec::new()));
        let seen = performed.clone();
        let dispatch = WorkDispatchLoop::new(
            "remote",
            DispatchConfig {
                job_id: "crawl".to_string(),
                node_id: "c0".to_string(),
                ..Default::default()
            },
            source,
            Arc::new(move |work: KeyedWork, _die: CancellationToken, _pause: CancellationToken| {
                let seen = seen.clone();
                async move {
                    seen.lock().push(work.key());
                    true
                }
            }),
            Arc::new(MemoryFailureLog::new()),
        );

        let pumped = dispatch.run(&cancel).await;
        dispatch.wait_until_finished(Duration::from_millis(10)).await;
        assert_eq!(pumped, 2);
        assert_eq!(dispatch.num_submitted(), 2);

        let mut keys = performed.lock().clone();
        keys.sort();
        assert_eq!(keys, vec![Some(1), Some(2)]);
        assert!(rotation.disabled().await.is_empty());
        dispatch.shutdown(false).await;
        println!("  ✓ Две страницы обработаны, затем DONE");
    }

    #[test]
    fn test_rotation_config_serde() {
        let config: RotationConfig = serde_json::from_str(r#"{"retries": 10}"#).unwrap();
        assert_eq!(config.retries, 10);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_types_are_thread_safe() {
        assert_send_sync::<ServerRotation>();
        assert_send_sync::<RemoteWorkSource>();
        assert_send_sync::<WorkDispatchLoop>();
    }
}
