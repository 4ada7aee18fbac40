use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream as StdTcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    config::{Config, Forward, IoParams},
    relay::{Relay, RelayOutcome},
};

/// Accepts connections for every configured forward and relays each one to
/// its target on a blocking worker.
pub struct ForwardServer {
    config: Config,
    shutdown: CancellationToken,
    sessions: Arc<SessionRegistry>,
    tracker: TaskTracker,
}

impl ForwardServer {
    pub async fn from_config_file(config_path: &str) -> Result<Self> {
        let config = Config::load(config_path).await?;
        Ok(Self::new(config))
    }

    pub fn new(config: Config) -> Self {
        ForwardServer {
            config,
            shutdown: CancellationToken::new(),
            sessions: Arc::new(SessionRegistry::default()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Binds every forward and starts accepting.
    pub async fn start(self) -> Result<RunningServer> {
        let mut addrs = HashMap::new();
        let mut listeners = Vec::with_capacity(self.config.forwards.len());
        for forward in &self.config.forwards {
            let listener = TcpListener::bind(forward.bind)
                .await
                .with_context(|| format!("{}: bind {}", forward.name, forward.bind))?;
            let local = listener.local_addr().context("local_addr")?;
            info!("{} listening on {}, forwarding to {}", forward.name, local, forward.target);
            addrs.insert(forward.name.clone(), local);
            listeners.push((Arc::new(forward.clone()), listener));
        }

        #[cfg(feature = "metrics")]
        let metrics_addr = match &self.config.metrics {
            Some(metrics) => Some(metrics.listen(self.shutdown.clone()).await?),
            None => None,
        };

        for (forward, listener) in listeners {
            let ctx = AcceptContext {
                forward,
                io_params: self.config.io_params.clone(),
                shutdown: self.shutdown.clone(),
                sessions: self.sessions.clone(),
                tracker: self.tracker.clone(),
            };
            self.tracker.spawn(ctx.accept_loop(listener));
        }

        Ok(RunningServer {
            addrs,
            #[cfg(feature = "metrics")]
            metrics_addr,
            shutdown: self.shutdown,
            sessions: self.sessions,
            tracker: self.tracker,
            shutdown_timeout: Duration::from_secs(self.config.shutdown_timeout),
        })
    }

    /// Runs until Ctrl-C or until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let token = self.shutdown_token();
        let running = self.start().await?;
        tokio::select! {
            ret = tokio::signal::ctrl_c() => {
                ret.context("listen for ctrl-c")?;
                info!("received ctrl-c");
            }
            _ = token.cancelled() => {}
        }
        running.shutdown().await
    }
}

pub struct RunningServer {
    addrs: HashMap<String, SocketAddr>,
    #[cfg(feature = "metrics")]
    metrics_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    sessions: Arc<SessionRegistry>,
    tracker: TaskTracker,
    shutdown_timeout: Duration,
}

impl RunningServer {
    /// Address a forward is listening on.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.addrs.get(name).copied()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Stops accepting, shuts down live endpoints so their relays observe a
    /// hangup, and waits for the sessions to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        let live = self.sessions.close();
        info!("shutting down, {} live sessions", live);
        self.tracker.close();
        tokio::time::timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .map_err(|_| {
                anyhow!(
                    "{} sessions still running after {:?}",
                    self.sessions.len(),
                    self.shutdown_timeout
                )
            })
    }
}

struct AcceptContext {
    forward: Arc<Forward>,
    io_params: IoParams,
    shutdown: CancellationToken,
    sessions: Arc<SessionRegistry>,
    tracker: TaskTracker,
}

impl AcceptContext {
    async fn accept_loop(self, listener: TcpListener) {
        let ctx = Arc::new(self);
        loop {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        let ctx2 = ctx.clone();
                        ctx.tracker.spawn(async move { ctx2.handle(client, peer).await });
                    }
                    Err(e) => warn!("{}: accept error: {}", ctx.forward.name, e),
                }
            }
        }
        debug!("{}: stopped accepting", ctx.forward.name);
    }

    async fn handle(&self, client: TcpStream, peer: SocketAddr) {
        let name = &self.forward.name;
        match self.serve(client, peer).await {
            Ok(outcome) if outcome.is_graceful() => info!(
                "{}: {} finished: {} a->b={} b->a={}",
                name, peer, outcome.termination, outcome.stats.a_to_b, outcome.stats.b_to_a
            ),
            Ok(outcome) => warn!(
                "{}: {} terminated: {} cause: {:?} a->b={} b->a={}",
                name,
                peer,
                outcome.termination,
                std::error::Error::source(&outcome.termination),
                outcome.stats.a_to_b,
                outcome.stats.b_to_a
            ),
            Err(e) => warn!("{}: {} failed: {:#}", name, peer, e),
        }
    }

    async fn serve(&self, client: TcpStream, peer: SocketAddr) -> Result<RelayOutcome> {
        let target = self.forward.target.as_str();
        debug!("{}: {} connecting to {}", self.forward.name, peer, target);
        let upstream = TcpStream::connect(target)
            .await
            .with_context(|| format!("connect to {}", target))?;

        let client = into_blocking(client).context("client socket")?;
        let upstream = into_blocking(upstream).context("upstream socket")?;
        let guard = self.sessions.register(&client, &upstream)?;
        let io_params = self.io_params.clone();

        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            Relay::new(&client, &upstream).with_io_params(&io_params).run()
        })
        .await
        .context("relay task")
    }
}

// the relay expects plain blocking sockets it does not have to register anywhere
fn into_blocking(stream: TcpStream) -> Result<StdTcpStream> {
    let stream = stream.into_std().context("into_std")?;
    stream.set_nonblocking(false).context("set_nonblocking")?;
    if let Err(e) = set_keepalive(&stream) {
        debug!("keepalive not set: {}", e);
    }
    Ok(stream)
}

fn set_keepalive(stream: &StdTcpStream) -> Result<()> {
    use nix::sys::socket::{setsockopt, sockopt::KeepAlive};
    setsockopt(stream, KeepAlive, &true).context("setsockopt")
}

/// Live relay sessions, kept so shutdown can interrupt them.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    closed: bool,
    next_id: u64,
    live: HashMap<u64, [StdTcpStream; 2]>,
}

impl SessionRegistry {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks a pair until the returned guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        a: &StdTcpStream,
        b: &StdTcpStream,
    ) -> Result<SessionGuard> {
        let handles = [
            a.try_clone().context("clone endpoint")?,
            b.try_clone().context("clone endpoint")?,
        ];
        let mut registry = self.lock();
        if registry.closed {
            bail!("server is shutting down");
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.live.insert(id, handles);
        Ok(SessionGuard {
            id,
            registry: self.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses new sessions and shuts down the endpoints of live ones.
    /// Returns how many sessions were live.
    pub fn close(&self) -> usize {
        let mut registry = self.lock();
        registry.closed = true;
        for stream in registry.live.values().flatten() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!("shutdown endpoint: {}", e);
            }
        }
        registry.live.len()
    }
}

pub struct SessionGuard {
    id: u64,
    registry: Arc<SessionRegistry>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.lock().live.remove(&self.id);
    }
}
