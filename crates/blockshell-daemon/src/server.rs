use std::os::unix::net::UnixListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use blockshell_common::init_tracing;
use blockshell_terminal::Executor;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::handlers::HandlerContext;
use crate::handlers::register_all;
use crate::lock_file::LockFile;
use crate::mcp_registry::McpRegistry;
use crate::notifications::NotificationRelay;
use crate::pool::JobRunner;
use crate::pool::ThreadPool;
use crate::rpc::ConnectionLimits;
use crate::rpc::RpcServer;
use crate::signal_handler::SignalHandler;
use crate::store::BlockStore;
use crate::store::SessionPersistence;

const CHANNEL_CAPACITY: usize = 128;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const POOL_JOIN_GRACE: Duration = Duration::from_secs(1);

/// A bound, ready-to-run daemon. Holds the instance lock for its lifetime.
pub struct Daemon {
    config: DaemonConfig,
    listener: UnixListener,
    server: Arc<RpcServer>,
    store: Arc<BlockStore>,
    mcp: Arc<McpRegistry>,
    jobs: JobRunner,
    shutdown: Arc<AtomicBool>,
    _lock: LockFile,
}

fn bind_socket(socket_path: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            DaemonError::SocketBind(format!("failed to create {}: {}", parent.display(), e))
        })?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path).map_err(|e| {
            DaemonError::SocketBind(format!("failed to remove stale socket: {}", e))
        })?;
    }

    let listener = UnixListener::bind(socket_path)
        .map_err(|e| DaemonError::SocketBind(format!("failed to bind socket: {}", e)))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| DaemonError::SocketBind(format!("failed to set non-blocking: {}", e)))?;

    Ok(listener)
}

fn run_accept_loop(listener: &UnixListener, pool: &ThreadPool<UnixStream>, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _addr)) => {
                if let Err(stream) = pool.execute(stream) {
                    warn!("Connection queue full, dropping connection");
                    drop(stream);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !shutdown.load(Ordering::Relaxed) {
                    error!(error = %e, "Error accepting connection");
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
}

fn wait_for_requests(server: &RpcServer, timeout: Duration) {
    info!(
        active_connections = server.active_connections(),
        in_flight = server.in_flight(),
        "Waiting for in-flight requests to complete"
    );
    let deadline = Instant::now() + timeout;
    while server.in_flight() > 0 {
        if Instant::now() > deadline {
            warn!("Shutdown timeout, forcing close");
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

impl Daemon {
    /// Acquire the instance lock, load persisted sessions, wire up handlers
    /// and bind the socket.
    pub fn bind(config: DaemonConfig) -> Result<Self, DaemonError> {
        let lock = LockFile::acquire(&config.lock_path())?;

        let store = Arc::new(BlockStore::with_persistence(SessionPersistence::new(
            config.sessions_file(),
        )));
        store.load_sessions();

        let server = Arc::new(RpcServer::new(ConnectionLimits::from(&config)));
        store.add_observer(Arc::new(NotificationRelay::new(&server)));

        let shutdown = Arc::new(AtomicBool::new(false));
        let jobs = JobRunner::new("job", config.max_jobs);

        let mcp = Arc::new(McpRegistry::new());
        let context = Arc::new(HandlerContext {
            store: Arc::clone(&store),
            executor: Executor::new(),
            jobs: jobs.clone(),
            mcp: Arc::clone(&mcp),
        });
        register_all(&server, &context);

        let listener = bind_socket(&config.socket_path)?;
        info!(
            socket = %config.socket_path.display(),
            data_dir = %config.data_dir.display(),
            pid = std::process::id(),
            "Daemon started"
        );

        Ok(Self {
            config,
            listener,
            server,
            store,
            mcp,
            jobs,
            shutdown,
            _lock: lock,
        })
    }

    /// Setting this flag makes [`Daemon::run`] shut down and return.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn server(&self) -> &Arc<RpcServer> {
        &self.server
    }

    /// Serve until the shutdown flag is set, then tear everything down.
    pub fn run(self) -> Result<(), DaemonError> {
        let server = Arc::clone(&self.server);
        let conn_pool = ThreadPool::new(
            "conn",
            self.config.max_connections,
            CHANNEL_CAPACITY,
            Arc::clone(&self.shutdown),
            move |stream: UnixStream| server.serve_connection(stream),
        )
        .map_err(|e| DaemonError::ThreadPool(e.to_string()))?;

        run_accept_loop(&self.listener, &conn_pool, &self.shutdown);

        info!("Shutting down daemon...");
        self.mcp.close_all();
        wait_for_requests(&self.server, SHUTDOWN_GRACE);
        self.server.disconnect_all();
        conn_pool.shutdown(POOL_JOIN_GRACE);
        self.jobs.wait_idle(POOL_JOIN_GRACE);

        if let Err(e) = self.store.save_sessions() {
            warn!(error = %e, "Failed to save sessions at shutdown");
        }
        if self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }

        info!("Daemon shutdown complete");
        Ok(())
    }
}

/// Run the daemon in the foreground until SIGINT or SIGTERM.
pub fn start_daemon(config: DaemonConfig) -> Result<(), DaemonError> {
    let _telemetry = init_tracing("info");

    let daemon = Daemon::bind(config)?;
    let _signal_handler = SignalHandler::setup(daemon.shutdown_flag())?;
    daemon.run()
}
