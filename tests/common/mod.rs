//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;
use worklet_host::{Engine, Script, ScriptSource, WorkletEnv, WorkletHost};

/// Installs a subscriber once; set `RUST_LOG=worklet_host=debug` for output.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Echoes every primary-channel message back until end of stream.
pub fn echo_engine() -> Arc<dyn Engine> {
    Arc::new(|_: Script, env: WorkletEnv| async move {
        let ipc = env.ipc();
        while let Some(message) = ipc.read().await.map_err(|e| e.to_string())? {
            ipc.write(message).await.map_err(|e| e.to_string())?;
        }
        Ok::<(), String>(())
    })
}

/// Answers every push with its payload reversed.
pub fn reverse_engine() -> Arc<dyn Engine> {
    Arc::new(|_: Script, mut env: WorkletEnv| async move {
        while let Some(push) = env.pushes().next().await {
            let mut payload = push.payload().to_vec();
            payload.reverse();
            push.reply(payload).await.map_err(|e| e.to_string())?;
        }
        Ok::<(), String>(())
    })
}

/// Receives pushes and never answers them.
pub fn silent_engine() -> Arc<dyn Engine> {
    Arc::new(|_: Script, mut env: WorkletEnv| async move {
        let mut held = Vec::new();
        while let Some(push) = env.pushes().next().await {
            held.push(push);
        }
        Ok::<(), String>(())
    })
}

/// Does nothing until terminated.
pub fn idle_engine() -> Arc<dyn Engine> {
    Arc::new(|_: Script, env: WorkletEnv| async move {
        env.shutdown().cancelled().await;
        Ok::<(), String>(())
    })
}

/// Starts a worklet with an inline script.
pub async fn start(engine: Arc<dyn Engine>) -> anyhow::Result<WorkletHost> {
    init_tracing();
    let host = WorkletHost::builder()
        .shared_engine(engine)
        .source(ScriptSource::code("test.js", "/* test */"))
        .create()
        .await?;
    Ok(host)
}
