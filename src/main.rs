use async_cluster::{
    Config,
    DispatchConfig,
    KeyedWork,
    MemoryFailureLog,
    QueueWorkSource,
    WorkDispatchLoop,
};
use std::{sync::Arc, time::Instant};
use tokio::{runtime::Builder, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;


const NUM_UNITS: usize = 200;

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = Builder::new_multi_thread()
        .worker_threads(8)
        .enable_all()
        .build()?;

    rt.block_on(async {
        let now = Instant::now();

        let source = QueueWorkSource::from_payloads("demo", (0..NUM_UNITS).map(|i| format!("unit-{}", i)));
        source.close();

        let failures = Arc::new(MemoryFailureLog::new());
        let config = DispatchConfig {
            pool: Config::io_bound().with_workers(16).with_queue_size(32),
            ..Default::default()
        };

        let dispatch = WorkDispatchLoop::new(
            "demo",
            config,
            Arc::new(source),
            Arc::new(|work: KeyedWork, die: CancellationToken, _pause: CancellationToken| async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5 + work.key().unwrap_or(0) % 10)) => true,
                    _ = die.cancelled() => false,
                }
            }),
            failures.clone(),
        );

        let cancel = CancellationToken::new();
        let pumped = dispatch.run(&cancel).await;
        dispatch.wait_until_finished(Duration::from_millis(100)).await;
        println!("{}", dispatch.status());
        dispatch.shutdown(false).await;

        println!(
            "pumped: {}  submitted: {}  failed: {}  elapsed: {:?}",
            pumped,
            dispatch.num_submitted(),
            failures.len(),
            now.elapsed()
        );
    });

    Ok(())
}
