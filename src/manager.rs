//! Tunnel Manager (TM): owns the registry of live tunnels and drives the
//! process-wide keepalive ticker.
//!
//! Deregistration happens from `Drop`: a tunnel removes itself from the
//! manager's map when its task's `Tunnel` value drops, rather than the
//! manager polling for liveness.

use crate::tunnel::{self, TunnelHandle, TunnelId};
use fastwebsockets::WebSocket;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

pub struct TunnelManager {
    next_id: AtomicU64,
    tunnels: RwLock<HashMap<TunnelId, TunnelHandle>>,
    cap: usize,
    keepalive_period: Duration,
}

impl TunnelManager {
    pub fn new(cap: usize, keepalive_period: Duration) -> Arc<Self> {
        let manager = Arc::new(Self {
            next_id: AtomicU64::new(1),
            tunnels: RwLock::new(HashMap::new()),
            cap,
            keepalive_period,
        });
        spawn_keepalive_ticker(Arc::downgrade(&manager), keepalive_period);
        manager
    }

    /// Accepts an upgraded WebSocket, allocates it a tunnel id, and spawns
    /// its task. The manager's map is updated before the task can possibly
    /// observe a close, so there is never a window where a live tunnel is
    /// unregistered.
    pub fn accept(self: &Arc<Self>, ws: WebSocket<TokioIo<Upgraded>>) -> TunnelId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = tunnel::spawn(self.clone(), id, self.cap, ws, self.keepalive_period);
        self.tunnels.write().insert(id, handle);
        info!(tunnel_id = id, "tunnel registered, {} active", self.tunnels.read().len());
        id
    }

    pub fn active_count(&self) -> usize {
        self.tunnels.read().len()
    }

    /// Called synchronously from `Tunnel::drop`; must not await, hence the
    /// synchronous `parking_lot::RwLock` rather than tokio's async one.
    pub fn on_tunnel_closed(&self, id: TunnelId) {
        if self.tunnels.write().remove(&id).is_some() {
            info!(tunnel_id = id, "tunnel deregistered, {} active", self.active_count());
        }
    }

    fn keepalive_tick(&self) {
        let handles: Vec<TunnelHandle> = self.tunnels.read().values().cloned().collect();
        for handle in handles {
            handle.keepalive_tick();
        }
    }
}

/// Starts the singleton ticker; stops automatically once the manager itself
/// is dropped, since it only ever holds a `Weak` reference.
///
/// Ticks once per `period`, matching the single ticker that drives every
/// tunnel's `keepalive(now, P)`: a tunnel's `last_activity` check fires at
/// most once per tick, so ticking faster than `P` would send pings roughly
/// twice as often as intended.
fn spawn_keepalive_ticker(manager: Weak<TunnelManager>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match manager.upgrade() {
                Some(manager) => manager.keepalive_tick(),
                None => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_manager_starts_empty() {
        let manager = TunnelManager::new(16, Duration::from_secs(10));
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn on_tunnel_closed_is_a_noop_for_unknown_id() {
        let manager = TunnelManager::new(16, Duration::from_secs(10));
        manager.on_tunnel_closed(999);
        assert_eq!(manager.active_count(), 0);
    }
}
