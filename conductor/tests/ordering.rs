//! Ordering and id-fidelity guarantees across the pipeline.

mod support;

use serde_json::json;
use support::{client_pipes, component_pipes, spawn_conductor, transparent_proxy};

use conductor::Conductor;

/// A client that fires initialize, a notification, a request, and a
/// second notification back-to-back must be observed in exactly that
/// order by the proxy (enveloped) and by the agent (unwrapped).
#[tokio::test]
async fn frames_stay_ordered_across_a_proxy() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (mut client, conductor_out, conductor_in) = client_pipes();
            let (proxy_peer, proxy_provider) = component_pipes();
            let (mut agent, agent_provider) = component_pipes();
            let handle = spawn_conductor(
                Conductor::new(vec![proxy_provider, agent_provider]),
                conductor_out,
                conductor_in,
            );

            let (observed_tx, mut observed_rx) = tokio::sync::mpsc::unbounded_channel();
            tokio::task::spawn_local(transparent_proxy(proxy_peer, observed_tx));

            client
                .send(json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}))
                .await;
            client
                .send(json!({"jsonrpc":"2.0","method":"n1","params":{"seq":1}}))
                .await;
            client
                .send(json!({"jsonrpc":"2.0","id":2,"method":"foo","params":{"seq":2}}))
                .await;
            client
                .send(json!({"jsonrpc":"2.0","method":"n2","params":{"seq":3}}))
                .await;

            // Agent side: initialize first (raw), then the replayed
            // traffic, unwrapped, in submission order.
            let init = agent.recv().await;
            assert_eq!(init["method"], json!("initialize"));
            agent
                .send(json!({"jsonrpc":"2.0","result":{},"id":init["id"]}))
                .await;

            let n1 = agent.recv().await;
            assert_eq!(n1["method"], json!("n1"));
            assert!(n1.get("id").is_none());

            let foo = agent.recv().await;
            assert_eq!(foo["method"], json!("foo"));
            agent
                .send(json!({"jsonrpc":"2.0","result":{"done":true},"id":foo["id"]}))
                .await;

            let n2 = agent.recv().await;
            assert_eq!(n2["method"], json!("n2"));

            // Client side: initialize response, then foo's, ids intact.
            assert_eq!(client.recv().await["id"], json!(1));
            let foo_response = client.recv().await;
            assert_eq!(foo_response["id"], json!(2));
            assert_eq!(foo_response["result"], json!({"done": true}));

            // Proxy side: everything after initialize arrived enveloped.
            let mut methods = Vec::new();
            while let Ok(frame) = observed_rx.try_recv() {
                if let Some(method) = frame.get("method").and_then(|m| m.as_str()) {
                    let logical = if method.starts_with("_proxy/successor/") {
                        frame["params"]["method"].as_str().unwrap().to_string()
                    } else {
                        method.to_string()
                    };
                    methods.push((method.to_string(), logical));
                }
            }
            let logical: Vec<&str> = methods.iter().map(|(_, l)| l.as_str()).collect();
            assert_eq!(logical, ["initialize", "n1", "foo", "n2"]);
            assert_eq!(methods[0].0, "initialize");
            assert_eq!(methods[1].0, "_proxy/successor/notification");
            assert_eq!(methods[2].0, "_proxy/successor/request");
            assert_eq!(methods[3].0, "_proxy/successor/notification");

            drop(client);
            let _ = handle.await.expect("conductor task should not panic");
        })
        .await;
}

/// String and integer ids survive the round trip with their JSON types
/// intact, while each hop sees its own freshly minted integer space.
#[tokio::test]
async fn request_id_types_are_preserved_exactly() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (mut client, conductor_out, conductor_in) = client_pipes();
            let (mut agent, agent_provider) = component_pipes();
            let handle = spawn_conductor(
                Conductor::new(vec![agent_provider]),
                conductor_out,
                conductor_in,
            );

            client
                .send(json!({"jsonrpc":"2.0","id":"client-init-1","method":"initialize","params":{}}))
                .await;
            let seen = agent.recv().await;
            assert_eq!(seen["id"], json!(1));
            agent.send(json!({"jsonrpc":"2.0","result":{},"id":1})).await;

            client
                .send(json!({"jsonrpc":"2.0","id":999,"method":"foo","params":{}}))
                .await;
            let seen = agent.recv().await;
            assert_eq!(seen["id"], json!(2));
            agent.send(json!({"jsonrpc":"2.0","result":{},"id":2})).await;

            client
                .send(json!({"jsonrpc":"2.0","id":"string-id-123","method":"bar","params":{}}))
                .await;
            let seen = agent.recv().await;
            assert_eq!(seen["id"], json!(3));
            agent.send(json!({"jsonrpc":"2.0","result":{},"id":3})).await;

            let first = client.recv().await;
            assert_eq!(first["id"], json!("client-init-1"));
            assert!(first["id"].is_string());

            let second = client.recv().await;
            assert_eq!(second["id"], json!(999));
            assert!(second["id"].is_i64());

            let third = client.recv().await;
            assert_eq!(third["id"], json!("string-id-123"));
            assert!(third["id"].is_string());

            drop(client);
            let _ = handle.await.expect("conductor task should not panic");
        })
        .await;
}

/// Backward traffic: an agent-originated request reaches the client raw
/// and its response finds its way back with the agent's id restored.
#[tokio::test]
async fn agent_originated_requests_round_trip() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (mut client, conductor_out, conductor_in) = client_pipes();
            let (mut agent, agent_provider) = component_pipes();
            let handle = spawn_conductor(
                Conductor::new(vec![agent_provider]),
                conductor_out,
                conductor_in,
            );

            client
                .send(json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}))
                .await;
            let init = agent.recv().await;
            agent
                .send(json!({"jsonrpc":"2.0","result":{},"id":init["id"]}))
                .await;
            client.recv().await;

            agent
                .send(json!({"jsonrpc":"2.0","id":"agent-req-9","method":"fs/read_text_file","params":{"path":"x"}}))
                .await;
            let seen = client.recv().await;
            assert_eq!(seen["method"], json!("fs/read_text_file"));
            assert_eq!(seen["id"], json!(1));

            client
                .send(json!({"jsonrpc":"2.0","result":{"content":"hi"},"id":1}))
                .await;
            let response = agent.recv().await;
            assert_eq!(response["id"], json!("agent-req-9"));
            assert_eq!(response["result"], json!({"content": "hi"}));

            drop(client);
            let _ = handle.await.expect("conductor task should not panic");
        })
        .await;
}
