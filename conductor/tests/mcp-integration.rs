//! Control-channel MCP integration: `_mcp/connect`, `_mcp/message`,
//! `_mcp/disconnect` driven over the client channel against registered
//! tool servers.

mod support;

use serde_json::{Value, json};
use support::{client_pipes, component_pipes, spawn_conductor};

use conductor::mcp_server::{ToolContext, ToolDef, ToolServer};
use conductor::Conductor;

fn echo_server() -> ToolServer {
    ToolServer::new("s", "1.0.0")
        .with_tool(ToolDef::new(
            "echo",
            "Echoes its input back.",
            json!({"type": "object"}),
            |input: Value, _cx: ToolContext| async move { Ok(input) },
        ))
        .with_tool(ToolDef::new(
            "boom",
            "Always fails.",
            json!({"type": "object"}),
            |_input: Value, _cx: ToolContext| async move {
                Err(anyhow::anyhow!("the tool exploded"))
            },
        ))
}

#[tokio::test]
async fn control_channel_connect_message_disconnect_round_trip() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (mut client, conductor_out, conductor_in) = client_pipes();
            let (mut agent, agent_provider) = component_pipes();

            let mut conductor = Conductor::new(vec![agent_provider]);
            let acp_url = conductor.register_tool_server(echo_server());
            let handle = spawn_conductor(conductor, conductor_out, conductor_in);

            // Bring the pipeline up first.
            client
                .send(json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}))
                .await;
            let init = agent.recv().await;
            agent
                .send(json!({"jsonrpc":"2.0","result":{},"id":init["id"]}))
                .await;
            client.recv().await;

            // Connect to the registered server.
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": 2,
                    "method": "_mcp/connect",
                    "params": {"url": acp_url}
                }))
                .await;
            let connected = client.recv().await;
            assert_eq!(connected["id"], json!(2));
            let result = &connected["result"];
            assert_eq!(result["serverInfo"]["name"], json!("s"));
            assert_eq!(result["capabilities"], json!({"tools": {}}));
            let tool_names: Vec<&str> = result["tools"]
                .as_array()
                .unwrap()
                .iter()
                .map(|tool| tool["name"].as_str().unwrap())
                .collect();
            assert_eq!(tool_names, ["echo", "boom"]);
            let connection_id = result["connectionId"].as_str().unwrap().to_string();

            // tools/list comes back as the raw MCP result.
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": 3,
                    "method": "_mcp/message",
                    "params": {"connectionId": connection_id, "method": "tools/list"}
                }))
                .await;
            let listed = client.recv().await;
            assert_eq!(listed["result"]["tools"][0]["name"], json!("echo"));

            // tools/call wraps the tool output as text content.
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": 4,
                    "method": "_mcp/message",
                    "params": {
                        "connectionId": connection_id,
                        "method": "tools/call",
                        "params": {"name": "echo", "arguments": {"k": "v"}}
                    }
                }))
                .await;
            let called = client.recv().await;
            let text = called["result"]["content"][0]["text"].as_str().unwrap();
            assert_eq!(
                serde_json::from_str::<Value>(text).unwrap(),
                json!({"k": "v"})
            );

            // A failing tool surfaces as -32603 with the failure text.
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": 5,
                    "method": "_mcp/message",
                    "params": {
                        "connectionId": connection_id,
                        "method": "tools/call",
                        "params": {"name": "boom", "arguments": {}}
                    }
                }))
                .await;
            let failed = client.recv().await;
            assert_eq!(failed["error"]["code"], json!(-32603));
            assert!(
                failed["error"]["message"]
                    .as_str()
                    .unwrap()
                    .contains("the tool exploded")
            );

            // Unknown MCP method inside the tunnel.
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": 6,
                    "method": "_mcp/message",
                    "params": {"connectionId": connection_id, "method": "resources/list"}
                }))
                .await;
            assert_eq!(client.recv().await["error"]["code"], json!(-32601));

            // Disconnect, then the connection is unknown.
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "method": "_mcp/disconnect",
                    "params": {"connectionId": connection_id}
                }))
                .await;
            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": 7,
                    "method": "_mcp/message",
                    "params": {"connectionId": connection_id, "method": "tools/list"}
                }))
                .await;
            let unknown = client.recv().await;
            assert_eq!(unknown["error"]["code"], json!(-32600));
            assert!(
                unknown["error"]["message"]
                    .as_str()
                    .unwrap()
                    .contains("Unknown connection")
            );

            drop(client);
            let _ = handle.await.expect("conductor task should not panic");
        })
        .await;
}

#[tokio::test]
async fn unknown_connection_is_rejected_without_a_connect() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let (mut client, conductor_out, conductor_in) = client_pipes();
            let (agent, agent_provider) = component_pipes();
            let handle = spawn_conductor(
                Conductor::new(vec![agent_provider]),
                conductor_out,
                conductor_in,
            );

            client
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "_mcp/message",
                    "params": {"connectionId": "never-connected", "method": "tools/list"}
                }))
                .await;
            let rejected = client.recv().await;
            assert_eq!(rejected["error"]["code"], json!(-32600));

            drop(client);
            drop(agent);
            let _ = handle.await.expect("conductor task should not panic");
        })
        .await;
}
