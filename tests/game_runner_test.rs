//! 多 Agent 运行：每个恢复码一个连接，并发运行直到全部结束

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use hive::config::{AgentEntry, AppConfig, RoleConfig};
use hive::core::{AgentManagerBuilder, GameRunner, ManagerSettings};
use hive::llm::MockLlmClient;
use hive::prompts::TemplateStore;
use hive::role::{AgentRole, PhaseSelection, Role, TemplateOnly};
use hive::transport::MemoryTransport;

fn game_config(url: &str) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.server.url = url.to_string();
    cfg.game.run_id = Some("1207".to_string());
    cfg.llm.provider = "mock".to_string();
    cfg.roles.push(RoleConfig {
        id: 2,
        name: "Owner".to_string(),
        task_phases: None,
        task_phases_excluded: Some(vec![3]),
    });
    cfg.agents = vec![
        AgentEntry {
            recovery: "a1b2".to_string(),
            role: None,
        },
        AgentEntry {
            recovery: "c3d4".to_string(),
            role: Some(2),
        },
    ];
    cfg
}

#[tokio::test]
async fn test_each_agent_joins_with_its_recovery_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (login_tx, mut login_rx) = mpsc::unbounded_channel::<Value>();

    let server = tokio::spawn(async move {
        let mut sessions = Vec::new();
        for _ in 0..2 {
            let (stream, _) = listener.accept().await.unwrap();
            let login_tx = login_tx.clone();
            sessions.push(tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                    login_tx.send(serde_json::from_str(&text).unwrap()).unwrap();
                }
                let _ = ws.close(None).await;
            }));
        }
        for session in sessions {
            session.await.unwrap();
        }
    });

    let cfg = game_config(&format!("ws://{addr}"));
    let runner = GameRunner::from_config(&cfg, Arc::new(TemplateStore::new()), &CancellationToken::new())
        .unwrap_or_else(|e| panic!("runner failed: {e}"));

    runner.run().await.unwrap();
    server.await.unwrap();

    let mut logins = vec![login_rx.recv().await.unwrap(), login_rx.recv().await.unwrap()];
    logins.sort_by_key(|login| login["recovery"].as_str().map(String::from));
    assert_eq!(
        logins,
        vec![
            json!({"gameId": 1207, "type": "join", "recovery": "a1b2"}),
            json!({"gameId": 1207, "type": "join", "recovery": "c3d4"}),
        ]
    );

    let agents = runner.agents();
    assert!(agents[0].1.roles().get().await.is_none());
    let held = agents[1].1.roles().get().await.unwrap();
    assert_eq!(held.role().name(), "Owner");
}

#[tokio::test]
async fn test_agents_act_independently_and_concurrently() {
    let mut cfg = AppConfig::default();
    cfg.game.run_id = Some("1207".to_string());
    let settings = ManagerSettings::from_config(&cfg).unwrap();

    let mut store = TemplateStore::new();
    store.add("all_system", "system").unwrap();
    store.add("all_user", "Phase {{ meta.phase }}: act as {{ meta.player_name }}.").unwrap();
    let store = Arc::new(store);

    let mut runner = GameRunner::new(Some("1207".to_string()));
    let mut transports = Vec::new();
    for (agent_id, name) in [(1u32, "Alice"), (2, "Bob")] {
        let transport = Arc::new(MemoryTransport::new());
        let mut state = hive::core::GameState::for_run("1207");
        state.meta.player_name = Some(name.to_string());
        let manager = AgentManagerBuilder::new(settings.clone())
            .with_transport(transport.clone())
            .with_llm(Arc::new(MockLlmClient::new()))
            .with_initial_state(state)
            .with_role(AgentRole::with_behavior(
                Role::new(1, "Trader", PhaseSelection::Any),
                &TemplateOnly,
                store.clone(),
            ))
            .with_initial_role(1)
            .build()
            .unwrap_or_else(|e| panic!("build failed: {e}"));
        runner = runner.with_agent(agent_id, manager);
        transports.push(transport);
    }
    let runner = Arc::new(runner);

    let game = Arc::clone(&runner);
    let run = tokio::spawn(async move { game.run().await });

    for transport in &transports {
        transport.push_json(&json!({"message_type": 1207, "type": "phase-transition", "data": {"phase": 2}}));
    }
    for transport in &transports {
        transport.wait_for_sent(1).await;
    }
    for (_, manager) in runner.agents() {
        manager.settle().await;
    }
    for transport in &transports {
        transport.disconnect();
    }
    run.await.unwrap().unwrap();

    assert_eq!(
        transports[0].sent_json(),
        vec![json!({"echo": "Phase 2: act as Alice.", "message_type": 1207})]
    );
    assert_eq!(
        transports[1].sent_json(),
        vec![json!({"echo": "Phase 2: act as Bob.", "message_type": 1207})]
    );
}
