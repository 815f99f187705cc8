// tests/bridge_test.rs
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bridge_protocol::transport::{Endpoint, duplex, lines};
use bridge_protocol::BusError;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use workerbridge::config::BridgeConfig;
use workerbridge::dispatcher::{ENGINE_NOT_INIT, NOT_FOUND_PROVIDER, NOT_FOUND_TRANSACTION_RESULT};
use workerbridge::memory::{DemoEngineFactory, MemoryStorage};
use workerbridge::registry::MethodTable;
use workerbridge::ui::{ClassRegistry, UiContext};
use workerbridge::worker::Worker;

const WAIT: Duration = Duration::from_secs(2);

type Calls = Arc<Mutex<Vec<(String, Vec<Value>)>>>;

/// UI classes recording every reverse call they answer.
fn recording_classes(calls: &Calls) -> ClassRegistry {
    let record = |name: &'static str, answer: Value| {
        let calls = calls.clone();
        move |args: Vec<Value>| {
            calls.lock().unwrap().push((name.to_string(), args));
            let answer = answer.clone();
            async move { Ok::<_, anyhow::Error>(answer) }
        }
    };
    ClassRegistry::new()
        .with_class("Utils", MethodTable::new().with("logX", record("Utils.logX", json!("logged"))))
        .with_class("TsUtils", MethodTable::new().with("logDebug", record("TsUtils.logDebug", json!(true))))
        .with_class(
            "ApiClient",
            MethodTable::new().with(
                "useOffchainEndPoint",
                record("ApiClient.useOffchainEndPoint", json!("https://offchain.example")),
            ),
        )
}

struct Pair {
    ui: UiContext,
    worker: Worker,
    calls: Calls,
}

async fn connect(ui_end: Endpoint, worker_end: Endpoint) -> Pair {
    let config = BridgeConfig::default();
    let (worker, _serving) = Worker::spawn(
        worker_end,
        &config,
        Arc::new(DemoEngineFactory),
        MemoryStorage::new().table(),
    );
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let (ui, _serving) = timeout(
        WAIT,
        UiContext::connect(ui_end, recording_classes(&calls), config.bus_config("ui")),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed");
    Pair { ui, worker, calls }
}

async fn pair() -> Pair {
    let (ui_end, worker_end) = duplex();
    connect(ui_end, worker_end).await
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, rx.recv()).await.expect("no event").expect("listener closed")
}

#[tokio::test]
async fn reverse_call_reaches_the_ui_class() {
    let Pair { worker, calls, .. } = pair().await;
    assert_eq!(worker.agents().names(), vec!["ApiClient", "TsUtils", "Utils"]);

    let out = timeout(WAIT, worker.agents().call("Utils", "logX", vec![json!("a"), json!("b")]))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(out, json!("logged"));
    assert_eq!(
        *calls.lock().unwrap(),
        vec![("Utils.logX".to_string(), vec![json!("a"), json!("b")])]
    );
}

#[tokio::test]
async fn unknown_route_fails_and_the_worker_keeps_serving() {
    let Pair { ui, .. } = pair().await;
    let err = ui.bus().post_async("wallet", vec![json!(1)]).await.unwrap_err();
    assert_eq!(err, BusError::Remote("route not found".into()));

    let err = ui.bus().post_async("controller", vec![]).await.unwrap_err();
    assert_eq!(err.to_string(), "invalid arguments for controller: missing component");

    assert_eq!(
        ui.call_controller("KeyringController", "isUnlocked", vec![]).await.unwrap(),
        json!(ENGINE_NOT_INIT)
    );
}

#[tokio::test]
async fn bootstrap_sends_snapshots_before_deltas() {
    let Pair { ui, .. } = pair().await;
    let mut states = ui.bus().subscribe("state");

    ui.init_engine(vec![json!({"PreferencesController": {"selectedAddress": "0x1"}})])
        .await
        .unwrap();
    ui.call_controller("PreferencesController", "setSelectedAddress", vec![json!("0x2")])
        .await
        .unwrap();
    ui.call_controller("PreferencesController", "setSelectedAddress", vec![json!("0x3")])
        .await
        .unwrap();

    let mut preferences = Vec::new();
    while preferences.len() < 3 {
        let event = next(&mut states).await;
        if event["key"] == "PreferencesController" {
            preferences.push(event);
        }
    }
    let overwrites: Vec<_> = preferences.iter().map(|e| e["overwrite"].clone()).collect();
    assert_eq!(overwrites, vec![json!(true), json!(false), json!(false)]);
    assert_eq!(preferences[1]["state"], json!({"selectedAddress": "0x2"}));

    let mirrored = ui.state().get("PreferencesController").unwrap();
    assert_eq!(mirrored, json!({"selectedAddress": "0x3", "identities": {}}));
    assert!(ui.state().get("NetworkController").is_some());
}

#[tokio::test]
async fn second_init_changes_nothing() {
    let Pair { ui, .. } = pair().await;
    assert_eq!(ui.init_engine(vec![]).await.unwrap(), Value::Null);
    ui.call_controller("PreferencesController", "setSelectedAddress", vec![json!("0x9")])
        .await
        .unwrap();
    assert_eq!(ui.init_engine(vec![]).await.unwrap(), Value::Null);

    let state = ui.call_engine("getState", vec![]).await.unwrap();
    assert_eq!(state["PreferencesController"]["selectedAddress"], json!("0x9"));
}

#[tokio::test]
async fn missing_provider_returns_error_payload() {
    let Pair { ui, .. } = pair().await;
    ui.init_engine(vec![json!({"rpcTypes": ["arb"]})]).await.unwrap();

    let out = ui
        .call_agent_provider("RpcNetworkController", Some("op"), "sendAsync", vec![json!({"id": 1})])
        .await
        .unwrap();
    assert_eq!(out, json!({"error": NOT_FOUND_PROVIDER}));

    let out = ui
        .call_agent_provider(
            "RpcNetworkController",
            Some("arb"),
            "sendAsync",
            vec![json!({"id": 2, "method": "eth_chainId"})],
        )
        .await
        .unwrap();
    assert_eq!(out["resultObj"], json!({"id": 2, "jsonrpc": "2.0", "result": "0xa4b1"}));
    assert_eq!(out["error"], Value::Null);
}

#[tokio::test]
async fn transaction_result_and_hub_forwarding() {
    let Pair { ui, .. } = pair().await;
    ui.init_engine(vec![]).await.unwrap();

    let (tx, mut published) = mpsc::unbounded_channel();
    ui.hubs()
        .get_or_create("TransactionController")
        .subscribe(Arc::new(move |args: &[Value]| {
            tx.send(args.to_vec()).unwrap();
        }));

    let added = ui
        .call_controller("TransactionController", "addTransaction", vec![json!({"to": "0xabc"})])
        .await
        .unwrap();
    let id = added["transactionMeta"]["id"].as_str().unwrap().to_string();

    let args = timeout(WAIT, published.recv()).await.unwrap().unwrap();
    assert_eq!(args[0], json!(format!("{id}:unapproved")));
    assert_eq!(args[1]["txParams"], json!({"to": "0xabc"}));

    assert_eq!(ui.call_transaction_result(&id).await.unwrap(), added["result"]);
    assert_eq!(
        ui.call_transaction_result("missing").await.unwrap_err(),
        BusError::Remote(NOT_FOUND_TRANSACTION_RESULT.into())
    );
}

#[tokio::test]
async fn lock_hooks_drive_the_ui_flag() {
    let Pair { ui, .. } = pair().await;
    ui.init_engine(vec![]).await.unwrap();

    ui.call_controller("KeyringController", "setLocked", vec![]).await.unwrap();
    assert!(ui.is_locked());

    let state = ui
        .call_controller("KeyringController", "submitPassword", vec![json!("hunter2")])
        .await
        .unwrap();
    assert_eq!(state["isUnlocked"], json!(true));
    assert!(!ui.is_locked());

    let err = ui
        .call_controller("KeyringController", "submitPassword", vec![json!("")])
        .await
        .unwrap_err();
    assert_eq!(err, BusError::Remote("Invalid password".into()));
}

#[tokio::test]
async fn engine_code_calls_back_into_the_ui() {
    let Pair { ui, calls, .. } = pair().await;
    ui.init_engine(vec![]).await.unwrap();

    assert_eq!(ui.call_engine("log", vec![json!("hello")]).await.unwrap(), json!(true));
    assert_eq!(
        ui.call_engine("refreshNetwork", vec![]).await.unwrap(),
        json!("https://offchain.example")
    );

    let seen = calls.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ("TsUtils.logDebug".to_string(), vec![json!("hello")]),
            ("ApiClient.useOffchainEndPoint".to_string(), vec![]),
        ]
    );
}

#[tokio::test]
async fn network_pushes_and_provider_events_reach_the_ui() {
    let Pair { ui, .. } = pair().await;
    let mut changed = ui.bus().subscribe("network_changed");
    let mut ended = ui.bus().subscribe("end_network_change");
    ui.init_engine(vec![]).await.unwrap();

    ui.call_controller("NetworkController", "setProviderType", vec![json!("sepolia")])
        .await
        .unwrap();
    assert_eq!(next(&mut changed).await, json!({"type": "Ethereum", "chainId": "0xaa36a7"}));
    assert_eq!(next(&mut ended).await, json!({"type": "Ethereum", "providerType": "sepolia"}));

    let (tx, mut events) = mpsc::unbounded_channel();
    ui.providers()
        .get_or_create("NetworkController")
        .subscribe(Arc::new(move |args: &[Value]| {
            tx.send(args.to_vec()).unwrap();
        }));
    let out = ui
        .call_agent_provider("NetworkController", None, "sendAsync", vec![json!({"method": "eth_subscribe"})])
        .await
        .unwrap();
    let args = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(args[0], json!("data"));
    assert_eq!(args[1]["subscription"], out["resultObj"]["result"]);
}

#[tokio::test]
async fn storage_calls_overlap_without_mixing_results() {
    let Pair { ui, worker, .. } = pair().await;

    let mut tasks = Vec::new();
    for i in 0..64 {
        let ui = ui.clone();
        tasks.push(tokio::spawn(async move {
            let key = format!("k{i:02}");
            ui.call_sqlite("setItem", vec![json!(key), json!(i)]).await.unwrap();
            ui.call_sqlite("getItem", vec![json!(key)]).await.unwrap()
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(timeout(WAIT, task).await.unwrap().unwrap(), json!(i));
    }

    let keys = ui.call_sqlite("getAllKeys", vec![]).await.unwrap();
    assert_eq!(keys.as_array().unwrap().len(), 64);
    assert_eq!(ui.bus().pending_count(), 0);
    assert_eq!(worker.bus().pending_count(), 0);
}

#[tokio::test]
async fn works_over_line_framed_streams() {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (near_r, near_w) = tokio::io::split(near);
    let (far_r, far_w) = tokio::io::split(far);
    let Pair { ui, worker, calls } = connect(lines(near_r, near_w), lines(far_r, far_w)).await;

    ui.init_engine(vec![]).await.unwrap();
    assert_eq!(
        ui.call_controller("KeyringController", "isUnlocked", vec![]).await.unwrap(),
        json!(false)
    );
    worker.agents().call("Utils", "logX", vec![json!({"nested": [1, null]})]).await.unwrap();
    assert_eq!(calls.lock().unwrap()[0].1, vec![json!({"nested": [1, null]})]);
}
