/// Directory node event loop
///
/// Owns the connection manager on top of the tokio socket layer and feeds
/// it socket events and periodic sweeps from a single task.

use anyhow::{Context, Result};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use veilnet_common::{directory, NodeConfig, VeilNetError};
use veilnet_core::{
    ConnectionId, ConnectionKind, ConnectionManager, DirPurpose, Interest, IoEvent,
    ManagerConfig, OpenRequest, Purpose, RegistryStats, SweepStats, TokioSocketLayer,
};

/// Outcome of a single connect probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub target: SocketAddr,
    pub connection: u64,
    pub connected: bool,
    pub state: String,
    pub close_reason: Option<String>,
    pub registry: RegistryStats,
}

/// A node that keeps directory connections open
pub struct DirectoryNode {
    config: NodeConfig,
    manager: ConnectionManager<TokioSocketLayer>,
    events: mpsc::UnboundedReceiver<IoEvent>,
}

impl DirectoryNode {
    /// Create a node; must be called from within a tokio runtime
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let (socket, events) = TokioSocketLayer::new(config.connect_timeout());
        if !socket.has_event_loop() {
            return Err(VeilNetError::internal("no tokio runtime available").into());
        }
        let manager = ConnectionManager::new(socket, ManagerConfig::from(&config));

        Ok(Self {
            config,
            manager,
            events,
        })
    }

    pub fn manager(&self) -> &ConnectionManager<TokioSocketLayer> {
        &self.manager
    }

    pub fn stats(&self) -> RegistryStats {
        self.manager.stats()
    }

    /// Open a consensus fetch to every configured directory server
    ///
    /// A server that already has a live connection for the same purpose is
    /// reused instead of dialed again.
    pub fn bootstrap(&mut self) -> Result<Vec<ConnectionId>> {
        let purpose = Purpose::Dir(DirPurpose::FetchConsensus);
        let mut opened = Vec::new();

        for server in &self.config.directory_servers {
            let addr: SocketAddr = server
                .parse()
                .map_err(|_| VeilNetError::InvalidAddress(server.clone()))?;

            if let Some(existing) = self.manager.registry().by_kind_address_port_purpose(
                ConnectionKind::Dir,
                &addr.ip(),
                addr.port(),
                purpose,
            ) {
                debug!("Reusing {} for {}", existing.id(), addr);
                continue;
            }

            let request = OpenRequest::directory(addr.ip(), addr.port(), DirPurpose::FetchConsensus)
                .with_resource(directory::FLAVOR_MICRODESC);
            let id = self.manager.open(request)?;
            info!("Fetching consensus from {} on {}", addr, id);
            opened.push(id);
        }

        Ok(opened)
    }

    fn handle_event(&mut self, event: IoEvent) {
        let connected = matches!(event, IoEvent::Connected { .. });
        let id = event.connection();

        if self.manager.handle_io_event(event) && connected {
            match self.manager.register_events(id, Interest::Readable) {
                Ok(true) => {}
                Ok(false) => debug!("No read registration for {}", id),
                Err(e) => warn!("Cannot watch {}: {}", id, e),
            }
        }
    }

    fn sweep(&mut self) -> Result<SweepStats> {
        let stats = self.manager.sweep();
        if stats.reclaimed > 0 {
            debug!(
                "Swept {} connections ({} dangling peers)",
                stats.reclaimed, stats.dangling_peers
            );
        }

        if let Err(e) = self.manager.registry().check_consistency() {
            error!("Connection registry is inconsistent: {}", e);
            return Err(VeilNetError::invariant(e.to_string()).into());
        }
        Ok(stats)
    }

    /// Drive the node until `shutdown` resolves, then close everything
    pub async fn run<F>(&mut self, shutdown: F) -> Result<SweepStats>
    where
        F: Future<Output = ()>,
    {
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(event) = self.events.recv() => {
                    self.handle_event(event);
                }
                _ = sweep.tick() => {
                    self.sweep()?;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        Ok(self.manager.shutdown())
    }

    /// Open one directory connection and wait until it connects or fails
    pub async fn probe(&mut self, target: SocketAddr) -> Result<ProbeReport> {
        let request = OpenRequest::directory(target.ip(), target.port(), DirPurpose::FetchConsensus);
        let id = self.manager.open(request)?;

        let deadline = self.config.connect_timeout() + Duration::from_secs(1);
        let settled = tokio::time::timeout(deadline, async {
            while !self.is_settled(id) {
                match self.events.recv().await {
                    Some(event) => self.handle_event(event),
                    None => break,
                }
            }
        })
        .await;
        if settled.is_err() {
            warn!("Probe of {} did not settle in {:?}", target, deadline);
        }

        let conn = self
            .manager
            .registry()
            .by_id(id)
            .context("probed connection vanished")?;
        let report = ProbeReport {
            target,
            connection: id.as_u64(),
            connected: conn.is_active() && !conn.state().is_connecting(),
            state: conn.state().to_string(),
            close_reason: conn.close_reason().map(str::to_string),
            registry: self.manager.stats(),
        };

        self.manager.mark_for_close(id)?;
        self.sweep()?;
        Ok(report)
    }

    fn is_settled(&self, id: ConnectionId) -> bool {
        self.manager
            .registry()
            .by_id(id)
            .map_or(true, |c| c.is_marked_for_close() || !c.state().is_connecting())
    }
}
