//! Echo worklet walkthrough.
//!
//! Demonstrates:
//! - Building a worklet with a closure engine
//! - Exchanging messages on the primary channel
//! - Push/reply with cancellation
//! - Suspend, resume and terminate
//!
//! Usage:
//!   cargo run --example echo
//!   cargo run --example echo -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use worklet_host::{Error, Result, Script, TextEncoding, WorkletEnv, WorkletHost};

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");
    init_logging(debug);

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        "worklet_host=trace"
    } else {
        "worklet_host=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

/// Echoes primary-channel messages and upper-cases pushes.
async fn script(script: Script, mut env: WorkletEnv) -> std::result::Result<(), String> {
    println!("        [worklet] started {} {:?}", script.filename, script.arguments);

    let ipc = env.ipc();
    let echo = async move {
        while let Ok(Some(message)) = ipc.read().await {
            if ipc.write(message).await.is_err() {
                break;
            }
        }
    };

    let pushes = async move {
        while let Some(push) = env.pushes().next().await {
            let reply = String::from_utf8_lossy(push.payload()).to_uppercase();
            if push.reply(reply.into_bytes()).await.is_err() {
                break;
            }
        }
    };

    tokio::join!(echo, pushes);
    Ok(())
}

async fn run() -> Result<()> {
    println!("=== Echo Worklet ===\n");

    // ========================================================================
    // Create Worklet
    // ========================================================================

    println!("[1] Creating worklet...");
    let host = WorkletHost::builder()
        .engine(script)
        .code("echo.js", "/* echo */")
        .argument("--demo")
        .memory_limit(16 * 1024 * 1024)
        .create()
        .await?;
    println!("    ✓ Worklet {} is {}\n", host.id(), host.state());

    // ========================================================================
    // Primary Channel
    // ========================================================================

    println!("[2] Echo on the primary channel...");
    host.ipc().write_text("hello worklet", TextEncoding::Utf8).await?;
    let echoed = host.ipc().read_text(TextEncoding::Utf8).await?;
    println!("    ✓ Echoed: {echoed:?}\n");

    // ========================================================================
    // Push / Reply
    // ========================================================================

    println!("[3] Push/reply...");
    let reply = host.push_text("shout this", TextEncoding::Utf8).await?;
    println!("    ✓ Reply: {reply}");

    let token = CancellationToken::new();
    token.cancel();
    match host.push_with_cancellation(b"too late".to_vec(), &token).await {
        Err(Error::Cancelled { request_id }) => println!("    ✓ Push {request_id} cancelled\n"),
        other => println!("    ? Unexpected outcome: {other:?}\n"),
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    println!("[4] Suspend and resume...");
    host.suspend(Duration::from_millis(50)).await?;
    println!("    ✓ State: {}", host.state());
    host.resume().await?;
    println!("    ✓ State: {}\n", host.state());

    println!("[5] Terminating...");
    host.terminate().await;
    println!("    ✓ State: {}", host.state());

    Ok(())
}
