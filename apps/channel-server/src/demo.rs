//! Application service mounted on the channel by the server binary.
//!
//! Every accepted channel gets the same treatment:
//! * a map carrying `payload` is echoed back as the array `[payload]`;
//! * a map carrying `stop` makes the server close the channel;
//! * a tick array is pushed every `tick_interval`;
//! * the channel is closed once `lifetime` has elapsed.
//!
//! With `broadcast` enabled, other maps are relayed to every open channel.

use std::{sync::Arc, time::Duration};

use channel_proto::{Map, SessionId};
use dashmap::DashSet;
use metrics::counter;
use serde_json::{json, Value};
use tokio::{
    task::JoinHandle,
    time::{interval_at, sleep, Instant},
};
use tracing::{debug, info, warn};

use crate::session::{ServerChannel, SessionRegistry};

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub tick_interval: Duration,
    pub lifetime: Duration,
    pub broadcast: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            lifetime: Duration::from_secs(5 * 60),
            broadcast: false,
        }
    }
}

#[derive(Clone)]
pub struct DemoService {
    registry: SessionRegistry,
    config: DemoConfig,
    peers: Arc<DashSet<SessionId>>,
}

impl DemoService {
    pub fn new(registry: SessionRegistry, config: DemoConfig) -> Self {
        Self {
            registry,
            config,
            peers: Arc::new(DashSet::new()),
        }
    }

    /// Accepts channels until the registry is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(channel) = self.registry.accept().await {
                let service = self.clone();
                tokio::spawn(async move { service.serve(channel).await });
            }
        })
    }

    async fn serve(&self, mut channel: ServerChannel) {
        let session_id = channel.session_id();
        info!(%session_id, client_version = channel.client_version(), "serving channel");
        self.peers.insert(session_id);

        let mut ticks_sent = 0u64;
        let mut ticks = interval_at(
            Instant::now() + self.config.tick_interval,
            self.config.tick_interval,
        );
        let expiry = sleep(self.config.lifetime);
        tokio::pin!(expiry);
        let mut closing = false;

        loop {
            tokio::select! {
                map = channel.next_map() => {
                    let Some(map) = map else {
                        info!(%session_id, "channel returned no more maps");
                        break;
                    };
                    if self.handle_map(&channel, map).await {
                        closing = true;
                    }
                }
                _ = ticks.tick(), if !closing => {
                    ticks_sent += 1;
                    if let Err(err) = channel.send_array(vec![json!({ "tick": ticks_sent })]).await {
                        debug!(%session_id, error = %err, "tick not sent");
                        closing = true;
                    }
                }
                _ = &mut expiry, if !closing => {
                    info!(%session_id, "channel lifetime elapsed; closing");
                    closing = true;
                    if let Err(err) = channel.close().await {
                        debug!(%session_id, error = %err, "close failed");
                    }
                }
            }
        }

        self.peers.remove(&session_id);
    }

    /// Returns `true` when the map asked the server to close the channel.
    async fn handle_map(&self, channel: &ServerChannel, map: Map) -> bool {
        let session_id = channel.session_id();
        if let Some(id) = map.get("id") {
            info!(%session_id, id = %id, "map received");
        }
        counter!("channel_server_demo_maps_total", 1);

        if map.contains_key("stop") {
            info!(%session_id, "client asked for stop");
            if let Err(err) = channel.close().await {
                debug!(%session_id, error = %err, "close failed");
            }
            return true;
        }

        if let Some(payload) = map.get("payload") {
            if let Err(err) = channel.send_array(vec![payload.clone()]).await {
                warn!(%session_id, error = %err, "echo failed");
            }
            return false;
        }

        if self.config.broadcast {
            self.broadcast(Value::from(map)).await;
        }
        false
    }

    async fn broadcast(&self, value: Value) {
        let peers: Vec<SessionId> = self.peers.iter().map(|peer| *peer).collect();
        for peer in peers {
            if let Err(err) = self.registry.send_array(peer, vec![value.clone()]).await {
                debug!(session_id = %peer, error = %err, "broadcast skipped");
            }
        }
    }
}
