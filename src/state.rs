// 全局状态：配置、存储、事件总线与通知跟踪的装配点。

use crate::api::dashboard::DashboardCache;
use crate::auth::JwtKeys;
use crate::bus::EventBus;
use crate::config::Config;
use crate::notify::NotificationTracker;
use crate::store::{build_store, Store};
use anyhow::Result;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub notifications: NotificationTracker,
    pub jwt: JwtKeys,
    pub dashboard: DashboardCache,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let store = build_store(&config)?;
        Ok(Self::with_store(config, store))
    }

    /// Wires the state around an already-built store; integration tests use
    /// this with the memory backend.
    pub fn with_store(config: Config, store: Arc<dyn Store>) -> Self {
        let jwt = JwtKeys::new(&config.jwt_secret);
        Self {
            config,
            store,
            bus: EventBus::new(),
            notifications: NotificationTracker::new(),
            jwt,
            dashboard: DashboardCache::new(),
        }
    }
}
