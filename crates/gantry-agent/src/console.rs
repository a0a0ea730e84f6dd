//! Console fan-out between server containers and WebSocket clients.
//!
//! Each server gets one broadcast channel for output lines and one
//! unbounded input channel. A pump task drains the input channel and
//! executes each line inside the container, but only while the server is
//! running. Input sent while the server is stopped is accepted and
//! dropped, so clients never block on a dead console.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::supervisor::Supervisor;

/// Output lines buffered per subscriber before the slowest one lags.
const OUTPUT_CAPACITY: usize = 256;

struct ServerConsole {
    output: broadcast::Sender<String>,
    input: mpsc::UnboundedSender<String>,
}

/// Per-server console channels.
pub struct ConsoleBridge {
    supervisor: Arc<Supervisor>,
    consoles: RwLock<HashMap<String, ServerConsole>>,
}

impl ConsoleBridge {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            consoles: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a client: returns the output stream and the input handle.
    ///
    /// The first attach for a server spins up its pump task; later clients
    /// share the same channels.
    pub async fn attach(
        &self,
        server_id: &str,
    ) -> (broadcast::Receiver<String>, mpsc::UnboundedSender<String>) {
        let mut consoles = self.consoles.write().await;
        let console = consoles.entry(server_id.to_string()).or_insert_with(|| {
            let (output, _) = broadcast::channel(OUTPUT_CAPACITY);
            let (input_tx, input_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump(
                self.supervisor.clone(),
                server_id.to_string(),
                input_rx,
                output.clone(),
            ));
            ServerConsole {
                output,
                input: input_tx,
            }
        });
        (console.output.subscribe(), console.input.clone())
    }

    /// Publish an output line to all subscribers. A line for a server with
    /// no console yet is dropped.
    pub async fn publish(&self, server_id: &str, line: String) {
        let consoles = self.consoles.read().await;
        if let Some(console) = consoles.get(server_id) {
            // Send only fails with zero receivers, which is fine.
            let _ = console.output.send(line);
        }
    }

    /// Drop a server's console, closing its input channel and pump task.
    pub async fn remove(&self, server_id: &str) {
        self.consoles.write().await.remove(server_id);
    }
}

/// Drain input lines into the container while the server runs.
async fn pump(
    supervisor: Arc<Supervisor>,
    server_id: String,
    mut input: mpsc::UnboundedReceiver<String>,
    output: broadcast::Sender<String>,
) {
    while let Some(line) = input.recv().await {
        match supervisor.send_command(&server_id, &line).await {
            Ok(()) => {
                let _ = output.send(format!("> {line}"));
            }
            Err(AgentError::Conflict(_)) => {
                // Server not running: accept and drop.
                debug!(%server_id, "console input dropped, server not running");
            }
            Err(err) => {
                warn!(%server_id, %err, "console command failed");
            }
        }
    }
    debug!(%server_id, "console pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::tests::{test_spec, test_supervisor};
    use std::time::Duration;

    async fn settle() {
        // Let the pump task run.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn output_fans_out_to_all_subscribers() {
        let (_engine, supervisor, _dir) = test_supervisor();
        let bridge = ConsoleBridge::new(Arc::new(supervisor));

        let (mut rx1, _in1) = bridge.attach("s1").await;
        let (mut rx2, _in2) = bridge.attach("s1").await;

        bridge.publish("s1", "[INFO] server ready".to_string()).await;
        assert_eq!(rx1.recv().await.unwrap(), "[INFO] server ready");
        assert_eq!(rx2.recv().await.unwrap(), "[INFO] server ready");
    }

    #[tokio::test]
    async fn input_executes_only_while_running() {
        let (engine, supervisor, _dir) = test_supervisor();
        let supervisor = Arc::new(supervisor);
        supervisor.create_server(test_spec("s1")).await.unwrap();
        let bridge = ConsoleBridge::new(supervisor.clone());

        let (mut rx, input) = bridge.attach("s1").await;

        // Stopped: accepted, dropped, no exec.
        input.send("say hello".to_string()).unwrap();
        settle().await;
        assert_eq!(engine.count("exec"), 0);

        supervisor.start_server("s1").await.unwrap();
        input.send("say hello".to_string()).unwrap();
        settle().await;
        assert_eq!(engine.count("exec"), 1);
        assert_eq!(rx.recv().await.unwrap(), "> say hello");
    }

    #[tokio::test]
    async fn publish_without_console_is_a_no_op() {
        let (_engine, supervisor, _dir) = test_supervisor();
        let bridge = ConsoleBridge::new(Arc::new(supervisor));
        bridge.publish("nobody", "line".to_string()).await;
    }

    #[tokio::test]
    async fn remove_detaches_the_console() {
        let (_engine, supervisor, _dir) = test_supervisor();
        let bridge = ConsoleBridge::new(Arc::new(supervisor));

        let (mut rx, input) = bridge.attach("s1").await;
        bridge.remove("s1").await;
        drop(input);
        settle().await;

        // Old subscribers see no further output.
        bridge.publish("s1", "line".to_string()).await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
        ));
    }
}
