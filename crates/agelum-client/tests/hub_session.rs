#![cfg(unix)]

use agelum_client::{
    Backend, HttpBackend, LaunchOptions, SessionStore, SlotController, SlotEvent, SlotState,
};
use agelum_core::{ToolCatalog, ToolDefinition};
use agelum_hub::{serve, HubOptions, HubState};
use agelum_runner::{HostConfig, SearchPath};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

struct Hub {
    base: String,
    _dir: TempDir,
    _stop: oneshot::Sender<()>,
}

async fn start_hub() -> Hub {
    start_hub_with(false).await
}

async fn start_hub_with(use_pty: bool) -> Hub {
    let dir = tempfile::tempdir().expect("tempdir");
    let hub = Arc::new(HubState::new(HubOptions {
        catalog: ToolCatalog::new(vec![
            ToolDefinition::cli("shell", "Shell", "sh").prompt_flag("-c")
        ]),
        search: SearchPath::from_env(),
        host: HostConfig {
            use_pty,
            ..HostConfig::default()
        },
        settings_path: None,
        history_path: dir.path().join("history.json"),
    }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn(serve(listener, hub, async move {
        let _ = stopped.await;
    }));
    Hub {
        base: format!("http://{addr}"),
        _dir: dir,
        _stop: stop,
    }
}

async fn until(
    events: &mut mpsc::UnboundedReceiver<SlotEvent>,
    done: impl Fn(&SlotEvent) -> bool,
) -> Vec<SlotEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        let stop = done(&event);
        seen.push(event);
        if stop {
            return seen;
        }
    }
}

fn finished(event: &SlotEvent) -> bool {
    matches!(event, SlotEvent::Finished { .. })
}

#[tokio::test]
async fn launch_runs_to_completion_and_lands_in_history() {
    let hub = start_hub().await;
    let backend = Arc::new(HttpBackend::new(&hub.base).unwrap());
    let store = Arc::new(SessionStore::new());
    let (slot, mut events) = SlotController::new(backend.clone(), store.clone(), "notes.md");

    let process_id = slot
        .launch(LaunchOptions::new("shell", "echo hi; exit 2"))
        .await
        .unwrap();
    until(&mut events, finished).await;
    assert_eq!(slot.state(), SlotState::Completed);
    assert_eq!(slot.transcript(), "hi\n\nProcess exited with code 2");
    assert!(!store.get("notes.md").unwrap().is_running);

    let status = backend.status(&process_id).await.unwrap();
    assert_eq!(status.exit_code, Some(2));

    let mut history = Vec::new();
    for _ in 0..100 {
        history = backend.history().await.unwrap();
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(history[0].process_id, process_id);
    assert_eq!(history[0].context_key, "notes.md");
}

#[tokio::test]
async fn second_client_reconnects_and_cancel_ends_both_streams() {
    let hub = start_hub().await;
    let backend = Arc::new(HttpBackend::new(&hub.base).unwrap());
    let store = Arc::new(SessionStore::new());
    let (first, mut first_events) = SlotController::new(backend.clone(), store.clone(), "A");
    first
        .launch(LaunchOptions::new("shell", "echo ready; exec sleep 30"))
        .await
        .unwrap();
    until(&mut first_events, |e| {
        matches!(e, SlotEvent::Output(text) if text.contains("ready"))
    })
    .await;

    let (second, mut second_events) = SlotController::new(backend.clone(), store.clone(), "A");
    assert!(second.reconnect().await);
    let replay = until(&mut second_events, |e| {
        matches!(e, SlotEvent::Output(text) if text.contains("ready"))
    })
    .await;
    assert_eq!(replay[0], SlotEvent::Reset);
    assert!(matches!(
        replay[1],
        SlotEvent::Started { resumed: true, .. }
    ));

    assert!(first.cancel().await);
    assert_eq!(first.state(), SlotState::Cancelled);
    assert!(first.transcript().ends_with("\n\nCancelled"));
    until(&mut second_events, finished).await;
    assert_eq!(second.state(), SlotState::Completed);
    assert!(!store.get("A").unwrap().is_running);

    let (third, _third_events) = SlotController::new(backend, store.clone(), "A");
    assert!(!third.reconnect().await);
    assert_eq!(third.state(), SlotState::Idle);
}

async fn wait_dead(backend: &HttpBackend, process_id: &str) {
    for _ in 0..150 {
        if !backend.status(process_id).await.unwrap().alive {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("process {process_id} still alive");
}

#[tokio::test]
async fn pty_slot_relays_input_interrupts_and_cancels() {
    let hub = start_hub_with(true).await;
    let backend = Arc::new(HttpBackend::new(&hub.base).unwrap());
    let store = Arc::new(SessionStore::new());
    let (slot, mut events) = SlotController::new(backend.clone(), store.clone(), "plan.md");

    slot.launch(LaunchOptions::new("shell", "read line; echo got:$line; exec sleep 30"))
        .await
        .unwrap();
    assert!(slot.send_input("ping\n").await.unwrap());
    until(&mut events, |e| {
        matches!(e, SlotEvent::Output(text) if text.contains("got:ping"))
    })
    .await;

    assert!(slot.interrupt().await.unwrap());
    until(&mut events, finished).await;
    assert_eq!(slot.state(), SlotState::Completed);

    let stubborn = slot
        .launch(LaunchOptions::new(
            "shell",
            "trap '' HUP; echo ready; sleep 30; echo survived",
        ))
        .await
        .unwrap();
    until(&mut events, |e| {
        matches!(e, SlotEvent::Output(text) if text.contains("ready"))
    })
    .await;
    assert!(slot.cancel().await);
    assert_eq!(slot.state(), SlotState::Cancelled);
    wait_dead(&backend, &stubborn).await;
    assert!(!store.get("plan.md").unwrap().is_running);
}
