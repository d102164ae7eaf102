use std::sync::Arc;
use std::sync::Weak;

use serde_json::json;

use crate::rpc::RpcServer;
use crate::store::BlockCompletion;
use crate::store::BlockObserver;
use crate::store::OutputChunk;

/// Forwards store events to every connected client as `block.output` and
/// `block.complete` notifications. Holds the server weakly since the server's
/// handlers own the store this relay is registered with.
pub struct NotificationRelay {
    server: Weak<RpcServer>,
}

impl NotificationRelay {
    pub fn new(server: &Arc<RpcServer>) -> Self {
        Self {
            server: Arc::downgrade(server),
        }
    }

    fn broadcast(&self, method: &str, params: serde_json::Value) {
        if let Some(server) = self.server.upgrade() {
            server.broadcast(method, params);
        }
    }
}

impl BlockObserver for NotificationRelay {
    fn on_output(&self, block_id: &str, chunk: &OutputChunk) {
        self.broadcast(
            "block.output",
            json!({
                "block_id": block_id,
                "data": chunk.data,
                "type": chunk.kind,
            }),
        );
    }

    fn on_complete(&self, completion: &BlockCompletion) {
        self.broadcast(
            "block.complete",
            json!({
                "block_id": completion.block_id,
                "session_id": completion.session_id,
                "exit_code": completion.exit_code,
                "duration_ms": completion.duration_ms,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlockStore;
    use std::io::BufRead;
    use std::io::BufReader;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_store_events_reach_clients_in_order() {
        let server = Arc::new(RpcServer::default());
        let store = BlockStore::in_memory();
        store.add_observer(Arc::new(NotificationRelay::new(&server)));

        let (client, conn) = UnixStream::pair().unwrap();
        let worker = {
            let server = Arc::clone(&server);
            std::thread::spawn(move || server.serve_connection(conn))
        };
        while server.client_count() == 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let block = store.create_block("s", "ls", None);
        store.append_output(&block, b"file1.txt", "stdout");
        store.complete_block(&block, 0);

        let mut reader = BufReader::new(client);
        let mut read = || {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            serde_json::from_str::<serde_json::Value>(&line).unwrap()
        };
        let output = read();
        assert_eq!(output["method"], "block.output");
        assert_eq!(
            output["params"],
            json!({"block_id": block, "data": "file1.txt", "type": "stdout"})
        );
        let complete = read();
        assert_eq!(complete["method"], "block.complete");
        assert_eq!(complete["params"]["session_id"], "s");
        assert_eq!(complete["params"]["exit_code"], 0);
        assert!(complete["params"]["duration_ms"].as_i64().unwrap() >= 0);

        server.disconnect_all();
        worker.join().unwrap();
    }

    #[test]
    fn test_relay_outliving_server_is_silent() {
        let server = Arc::new(RpcServer::default());
        let relay = NotificationRelay::new(&server);
        drop(server);
        relay.broadcast("block.output", json!({}));
    }
}
