use crate::market::service::MarketService;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Periodic sweep over orders: expiry, auto-approval, dispute deadlines and
/// settlement payouts
pub struct ExpiryMonitor {
    service: Arc<MarketService>,
    interval: Duration,
    /// Monitor running flag
    running: Arc<RwLock<bool>>,
}

impl ExpiryMonitor {
    pub fn new(service: Arc<MarketService>, interval: Duration) -> Self {
        Self {
            service,
            interval,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Spawn the sweep loop; `None` if it is already running
    pub async fn start(&self) -> Option<JoinHandle<()>> {
        let mut running = self.running.write().await;
        if *running {
            return None;
        }
        *running = true;

        let service = self.service.clone();
        let running_flag = self.running.clone();
        let period = self.interval;
        log::info!("Expiry monitor started (every {:?})", period);

        Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            while *running_flag.read().await {
                interval.tick().await;
                Self::tick(&service).await;
            }
            log::info!("Expiry monitor stopped");
        }))
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    async fn tick(service: &MarketService) {
        if let Err(e) = service.sweep(Utc::now()).await {
            log::warn!("Order sweep failed: {}", e);
        }
        match service.execute_settlements().await {
            Ok(0) => {}
            Ok(confirmed) => log::info!("Confirmed {} settlement legs", confirmed),
            Err(e) => log::warn!("Settlement payout failed: {}", e),
        }
    }
}
