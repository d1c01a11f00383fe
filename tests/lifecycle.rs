//! Lifecycle integration tests: construction, suspend, resume, terminate.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use worklet_host::{
    Configuration, Error, LifecycleState, ResourceLocator, Script, ScriptSource, TextEncoding,
    WorkletEnv, WorkletHost,
};

use common::{echo_engine, idle_engine, init_tracing, start};

const WAIT: Duration = Duration::from_secs(5);

/// Writes the script's filename, source and arguments on the primary channel.
fn introspect_engine() -> Arc<dyn worklet_host::Engine> {
    Arc::new(|script: Script, env: WorkletEnv| async move {
        let ipc = env.ipc();
        let report = format!(
            "{}|{}|{}|{}",
            script.filename,
            script.text(),
            script.arguments.join(","),
            script.configuration.memory_limit
        );
        ipc.write(report.into_bytes()).await.map_err(|e| e.to_string())?;
        env.shutdown().cancelled().await;
        Ok::<(), String>(())
    })
}

#[tokio::test]
async fn create_starts_script_with_arguments_and_configuration() -> anyhow::Result<()> {
    init_tracing();
    let host = WorkletHost::builder()
        .shared_engine(introspect_engine())
        .code("main.js", "run()")
        .arguments(["--a", "--b"])
        .memory_limit(4096)
        .create()
        .await?;

    assert_eq!(host.state(), LifecycleState::Running);
    let report = timeout(WAIT, host.ipc().read_text(TextEncoding::Utf8)).await??;
    assert_eq!(report.as_deref(), Some("main.js|run()|--a,--b|4096"));

    host.terminate().await;
    Ok(())
}

#[tokio::test]
async fn text_source_is_normalized_to_utf8() -> anyhow::Result<()> {
    init_tracing();
    let host = WorkletHost::builder()
        .shared_engine(introspect_engine())
        .text("wide.js", TextEncoding::Utf16Le.encode("héllo")?, TextEncoding::Utf16Le)
        .create()
        .await?;

    let report = timeout(WAIT, host.ipc().read_text(TextEncoding::Utf8)).await??;
    assert_eq!(report.as_deref(), Some("wide.js|héllo||0"));

    host.terminate().await;
    Ok(())
}

#[tokio::test]
async fn undecodable_text_fails_construction() {
    init_tracing();
    let err = WorkletHost::builder()
        .shared_engine(idle_engine())
        .text("odd.js", vec![0x41], TextEncoding::Utf16Be)
        .create()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Decode { encoding: TextEncoding::Utf16Be, .. }));
    assert!(err.is_construction_error());
}

#[tokio::test]
async fn binary_inline_source_reaches_engine_unchanged() -> anyhow::Result<()> {
    init_tracing();
    let engine: Arc<dyn worklet_host::Engine> = Arc::new(|script: Script, env: WorkletEnv| async move {
        env.ipc().write(script.source).await.map_err(|e| e.to_string())?;
        env.shutdown().cancelled().await;
        Ok::<(), String>(())
    });

    let host = WorkletHost::create(
        engine,
        ScriptSource::bytes("app.bundle", vec![0x00, 0xff, 0xfe, 0x01]),
        vec![],
        Configuration::new(),
    )
    .await?;

    assert_eq!(host.state(), LifecycleState::Running);
    let source = timeout(WAIT, host.ipc().read()).await??;
    assert_eq!(source, Some(vec![0x00, 0xff, 0xfe, 0x01]));

    host.terminate().await;
    Ok(())
}

#[tokio::test]
async fn resource_is_resolved_from_search_paths() -> anyhow::Result<()> {
    init_tracing();
    let empty = tempfile::tempdir()?;
    let root = tempfile::tempdir()?;
    fs::create_dir(root.path().join("dist"))?;
    fs::write(root.path().join("dist/app.bundle"), "bundled()")?;

    let host = WorkletHost::builder()
        .shared_engine(introspect_engine())
        .resource(ResourceLocator::new("app", "bundle").directory("dist"))
        .search_path(empty.path())
        .search_path(root.path())
        .create()
        .await?;

    let report = timeout(WAIT, host.ipc().read_text(TextEncoding::Utf8)).await??;
    assert_eq!(report.as_deref(), Some("app.bundle|bundled()||0"));

    host.terminate().await;
    Ok(())
}

#[tokio::test]
async fn explicit_bundle_overrides_search_paths() -> anyhow::Result<()> {
    init_tracing();
    let bundle = tempfile::tempdir()?;
    let search = tempfile::tempdir()?;
    fs::write(search.path().join("app.js"), "wrong()")?;

    let err = WorkletHost::builder()
        .shared_engine(idle_engine())
        .resource(ResourceLocator::new("app", "js").bundle(bundle.path()))
        .search_path(search.path())
        .create()
        .await
        .unwrap_err();

    match err {
        Error::ResourceNotFound { name, searched } => {
            assert_eq!(name, "app.js");
            assert_eq!(searched, vec![bundle.path().to_path_buf()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn suspend_and_resume_lose_no_messages() -> anyhow::Result<()> {
    let host = start(echo_engine()).await?;
    let ipc = host.ipc();

    ipc.write(b"before".to_vec()).await?;
    host.suspend(Duration::from_millis(100)).await?;
    assert_eq!(host.state(), LifecycleState::Suspended);

    // Echoed during the linger window.
    assert_eq!(timeout(WAIT, ipc.read()).await??, Some(b"before".to_vec()));

    // Parked: nothing comes back until resumed.
    ipc.write(b"while-suspended".to_vec()).await?;
    assert!(timeout(Duration::from_millis(100), ipc.read()).await.is_err());

    host.resume().await?;
    assert_eq!(host.state(), LifecycleState::Running);
    assert_eq!(
        timeout(WAIT, ipc.read()).await??,
        Some(b"while-suspended".to_vec())
    );

    host.terminate().await;
    Ok(())
}

#[tokio::test]
async fn script_observes_lifecycle_notifications() -> anyhow::Result<()> {
    let engine: Arc<dyn worklet_host::Engine> = Arc::new(|_: Script, env: WorkletEnv| async move {
        let ipc = env.ipc();
        let mut lifecycle = env.lifecycle();
        while lifecycle.changed().await.is_ok() {
            let state = *lifecycle.borrow_and_update();
            // Only the linger window is observable from inside the script.
            if state == LifecycleState::Suspended {
                ipc.write(state.as_str().as_bytes().to_vec())
                    .await
                    .map_err(|e| e.to_string())?;
            }
        }
        Ok::<(), String>(())
    });
    let host = start(engine).await?;

    host.suspend(Duration::from_millis(100)).await?;
    let seen = timeout(WAIT, host.ipc().read_text(TextEncoding::Utf8)).await??;
    assert_eq!(seen.as_deref(), Some("suspended"));

    host.terminate().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_suspends_transition_once() -> anyhow::Result<()> {
    let host = start(idle_engine()).await?;

    let (a, b) = tokio::join!(
        host.suspend(Duration::from_millis(20)),
        host.suspend(Duration::from_millis(20))
    );
    a?;
    b?;
    assert_eq!(host.state(), LifecycleState::Suspended);

    host.resume().await?;
    assert_eq!(host.state(), LifecycleState::Running);
    host.terminate().await;
    Ok(())
}

#[tokio::test]
async fn terminate_interrupts_linger() -> anyhow::Result<()> {
    let host = start(idle_engine()).await?;

    let suspending = {
        let host = host.clone();
        tokio::spawn(async move { host.suspend(Duration::from_secs(60)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    timeout(WAIT, host.terminate()).await?;
    timeout(WAIT, suspending).await???;
    assert_eq!(host.state(), LifecycleState::Terminated);
    Ok(())
}

#[tokio::test]
async fn suspend_then_terminate_fails_later_reads() -> anyhow::Result<()> {
    let host = start(echo_engine()).await?;

    host.suspend(Duration::ZERO).await?;
    host.terminate().await;

    let err = host.ipc().read().await.unwrap_err();
    assert!(matches!(err, Error::Terminated));
    assert!(err.is_closed());

    let err = host.ipc().write(b"late".to_vec()).await.unwrap_err();
    assert!(matches!(err, Error::Terminated));
    Ok(())
}

#[tokio::test]
async fn terminate_resolves_waiting_reader() -> anyhow::Result<()> {
    let host = start(idle_engine()).await?;

    let reader = {
        let ipc = host.ipc().clone();
        tokio::spawn(async move { ipc.read().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    host.terminate().await;
    let outcome = timeout(WAIT, reader).await??;
    assert!(matches!(outcome, Err(Error::Terminated)));
    Ok(())
}

#[tokio::test]
async fn terminate_is_idempotent_and_concurrent_safe() -> anyhow::Result<()> {
    let host = start(idle_engine()).await?;

    tokio::join!(host.terminate(), host.terminate());
    host.terminate().await;
    assert_eq!(host.state(), LifecycleState::Terminated);

    // Absorbing state.
    host.suspend(Duration::ZERO).await?;
    assert_eq!(host.state(), LifecycleState::Terminated);
    assert!(matches!(
        host.resume().await,
        Err(Error::InvalidState {
            state: LifecycleState::Terminated,
            ..
        })
    ));
    Ok(())
}

#[tokio::test]
async fn dropping_host_cancels_script() -> anyhow::Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));

    let engine: Arc<dyn worklet_host::Engine> = Arc::new(move |_: Script, env: WorkletEnv| {
        let tx = tx.lock().take();
        async move {
            env.shutdown().cancelled().await;
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
            Ok::<(), String>(())
        }
    });

    let host = start(engine).await?;
    drop(host);

    // Resolves when the script observes shutdown or its future is dropped.
    let _ = timeout(WAIT, rx).await?;
    Ok(())
}
