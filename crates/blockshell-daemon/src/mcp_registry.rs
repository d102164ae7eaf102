//! Named MCP server connections owned by the daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use blockshell_common::rwlock_read_or_recover;
use blockshell_common::rwlock_write_or_recover;
use blockshell_mcp::CALL_TIMEOUT;
use blockshell_mcp::Client;
use blockshell_mcp::McpError;
use blockshell_mcp::StdioTransport;
use blockshell_mcp::Tool;
use blockshell_mcp::ToolResult;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct McpServerSummary {
    pub name: String,
    pub command: String,
}

struct ConnectedServer {
    command: String,
    client: Client,
}

pub struct McpRegistry {
    servers: RwLock<HashMap<String, Arc<ConnectedServer>>>,
    call_timeout: Duration,
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl McpRegistry {
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            call_timeout: CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    fn get(&self, name: &str) -> Option<Arc<ConnectedServer>> {
        rwlock_read_or_recover(&self.servers).get(name).cloned()
    }

    /// Spawn `command`, perform the MCP handshake and register the client as
    /// `name`. An existing server with the same name is closed and replaced.
    /// Returns the tools the new server offers.
    pub fn connect(&self, name: &str, command: &str, args: Vec<String>) -> Result<Vec<Tool>, McpError> {
        let transport = Arc::new(StdioTransport::new(command, args));
        let client = Client::new(transport)
            .with_call_timeout(self.call_timeout)
            .with_client_info("blockshell", env!("CARGO_PKG_VERSION"));
        if let Err(e) = client.initialize() {
            client.close();
            return Err(e);
        }
        let tools = client.list_tools();

        let server = Arc::new(ConnectedServer {
            command: command.to_string(),
            client,
        });
        let previous = rwlock_write_or_recover(&self.servers).insert(name.to_string(), server);
        if let Some(previous) = previous {
            info!(name, "Replacing MCP server");
            previous.client.close();
        }
        info!(name, command, tools = tools.len(), "Connected MCP server");
        Ok(tools)
    }

    /// Registered servers, ordered by name.
    pub fn list(&self) -> Vec<McpServerSummary> {
        let mut servers: Vec<McpServerSummary> = rwlock_read_or_recover(&self.servers)
            .iter()
            .map(|(name, server)| McpServerSummary {
                name: name.clone(),
                command: server.command.clone(),
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        servers
    }

    pub fn list_tools(&self, name: &str) -> Option<Vec<Tool>> {
        self.get(name).map(|server| server.client.list_tools())
    }

    pub fn call_tool(&self, name: &str, tool: &str, arguments: serde_json::Value) -> Option<ToolResult> {
        self.get(name)
            .map(|server| server.client.call_tool(tool, arguments))
    }

    pub fn disconnect(&self, name: &str) -> bool {
        let removed = rwlock_write_or_recover(&self.servers).remove(name);
        match removed {
            Some(server) => {
                server.client.close();
                info!(name, "Disconnected MCP server");
                true
            }
            None => false,
        }
    }

    /// Close every transport, terminating the server processes.
    pub fn close_all(&self) {
        let servers: Vec<(String, Arc<ConnectedServer>)> =
            rwlock_write_or_recover(&self.servers).drain().collect();
        for (name, server) in servers {
            info!(name = %name, "Closing MCP server");
            server.client.close();
        }
    }

    pub fn len(&self) -> usize {
        rwlock_read_or_recover(&self.servers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_server_lookups() {
        let registry = McpRegistry::new();
        assert!(registry.list_tools("nope").is_none());
        assert!(registry
            .call_tool("nope", "echo", serde_json::json!({}))
            .is_none());
        assert!(!registry.disconnect("nope"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_connect_registers_nothing() {
        let registry = McpRegistry::new().with_call_timeout(Duration::from_millis(200));
        let result = registry.connect("broken", "/nonexistent/mcp-server", Vec::new());
        assert!(result.is_err());
        assert!(registry.list().is_empty());
    }
}
