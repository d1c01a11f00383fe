//! Notification service integration tests.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;
use worklet_host::{
    LifecycleState, NotificationContent, NotificationDelegate, NotificationRequest,
    NotificationService, Script, WorkletEnv, WorkletHost,
};

use common::{idle_engine, init_tracing, start};

const WAIT: Duration = Duration::from_secs(5);

/// Decrypts by upper-casing the body; replies with the full content JSON.
fn renderer() -> Arc<dyn worklet_host::Engine> {
    Arc::new(|_: Script, mut env: WorkletEnv| async move {
        while let Some(push) = env.pushes().next().await {
            let request: NotificationRequest =
                serde_json::from_slice(push.payload()).map_err(|e| e.to_string())?;
            let mut content = request.content;
            content.body = content.body.to_uppercase();
            content.badge = Some(1);
            let reply = serde_json::to_vec(&content).map_err(|e| e.to_string())?;
            push.reply(reply).await.map_err(|e| e.to_string())?;
        }
        Ok::<(), String>(())
    })
}

fn request(body: &str) -> NotificationRequest {
    NotificationRequest {
        identifier: "message-1".to_string(),
        content: NotificationContent {
            title: "New message".to_string(),
            body: body.to_string(),
            user_info: json!({ "thread": 7 }),
            ..Default::default()
        },
    }
}

async fn receive(service: &NotificationService, request: NotificationRequest) -> NotificationContent {
    let (tx, rx) = tokio::sync::oneshot::channel();
    service
        .did_receive(request, move |content| {
            let _ = tx.send(content);
        })
        .await;
    timeout(WAIT, rx).await.unwrap().unwrap()
}

#[tokio::test]
async fn default_delegate_renders_reply() -> anyhow::Result<()> {
    init_tracing();
    let service = NotificationService::new(
        WorkletHost::builder()
            .shared_engine(renderer())
            .code("render.js", "/* render */"),
    )
    .await?;

    let content = receive(&service, request("secret")).await;
    assert_eq!(content.title, "New message");
    assert_eq!(content.body, "SECRET");
    assert_eq!(content.badge, Some(1));
    assert_eq!(content.user_info, json!({ "thread": 7 }));

    service.time_will_expire().await;
    Ok(())
}

#[tokio::test]
async fn custom_delegate_sees_raw_reply() -> anyhow::Result<()> {
    struct Raw;

    #[async_trait]
    impl NotificationDelegate for Raw {
        async fn on_reply(
            &self,
            request: &NotificationRequest,
            reply: Vec<u8>,
        ) -> NotificationContent {
            NotificationContent {
                title: request.identifier.clone(),
                body: String::from_utf8_lossy(&reply).into_owned(),
                ..Default::default()
            }
        }
    }

    let service = NotificationService::from_host(start(renderer()).await?).with_delegate(Raw);
    let content = receive(&service, request("x")).await;

    assert_eq!(content.title, "message-1");
    let echoed: NotificationContent = serde_json::from_str(&content.body)?;
    assert_eq!(echoed.body, "X");

    service.time_will_expire().await;
    Ok(())
}

#[tokio::test]
async fn failed_push_delivers_original_content() -> anyhow::Result<()> {
    let service = NotificationService::from_host(start(idle_engine()).await?);
    service.host().terminate().await;

    let original = request("untouched");
    let content = receive(&service, original.clone()).await;
    assert_eq!(content, original.content);
    Ok(())
}

#[tokio::test]
async fn time_budget_expiry_notifies_and_terminates() -> anyhow::Result<()> {
    struct Watch(Arc<AtomicBool>);

    #[async_trait]
    impl NotificationDelegate for Watch {
        async fn on_reply(&self, request: &NotificationRequest, _: Vec<u8>) -> NotificationContent {
            request.content.clone()
        }

        fn on_time_budget_expired(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let expired = Arc::new(AtomicBool::new(false));
    let mut service = NotificationService::from_host(start(idle_engine()).await?);
    service.set_delegate(Some(Arc::new(Watch(Arc::clone(&expired)))));

    service.time_will_expire().await;
    assert!(expired.load(Ordering::SeqCst));
    assert_eq!(service.host().state(), LifecycleState::Terminated);
    Ok(())
}
