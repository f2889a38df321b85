/*!
Fake metrics engine

Listens on an ephemeral localhost port. Every accepted connection receives the
scripted lines in order, then the engine closes it, which is exactly what a
hub sees when the real engine restarts.
*/

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct FakeEngine {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakeEngine {
    /// Starts serving `lines` to every client that connects.
    pub async fn serve_lines(lines: Vec<String>) -> Result<Self> {
        crate::test_utils::init_logging();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicUsize::new(0));

        let mut script = String::new();
        for line in &lines {
            script.push_str(line.trim_end_matches('\n'));
            script.push('\n');
        }

        let counter = connections.clone();
        let task = tokio::spawn(async move {
            loop {
                let (mut socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("[engine-stub] accept failed: {e}");
                        continue;
                    }
                };
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                log::info!("[engine-stub] connection #{n} from {peer}");

                let script = script.clone();
                tokio::spawn(async move {
                    if let Err(e) = socket.write_all(script.as_bytes()).await {
                        log::warn!("[engine-stub] write failed: {e}");
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        Ok(Self { addr, connections, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}
