use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use core_types::ExploreRecord;
use metrics_exporter_prometheus::PrometheusHandle;
use pending_settlement::PendingExplorationStore;
use price_space::PriceSpace;

pub(crate) type PendingStore = PendingExplorationStore<String, ExploreRecord>;

/// Everything request handlers share, built once at startup.
pub(crate) struct AppContext {
    pub(crate) spaces: HashMap<String, Arc<PriceSpace>>,
    pub(crate) pending: Arc<PendingStore>,
}

impl AppContext {
    pub(crate) fn new(spaces: HashMap<String, Arc<PriceSpace>>) -> Self {
        Self {
            spaces,
            pending: Arc::new(PendingStore::new()),
        }
    }

    pub(crate) fn space(&self, context_hash: &str) -> Option<&Arc<PriceSpace>> {
        self.spaces.get(context_hash)
    }

    /// Parks an accepted exploration until feedback arrives. If none arrives
    /// within `ttl` the exploration is settled as a missed impression.
    pub(crate) fn track_exploration(
        &self,
        request_id: String,
        record: ExploreRecord,
        ttl: Duration,
        space: Arc<PriceSpace>,
    ) {
        self.pending.set(request_id, record, ttl, move |record| {
            metrics::counter!("optimizer.pending.expired").increment(1);
            space.update(&record, false);
        });
    }
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) ctx: Arc<AppContext>,
    pub(crate) prometheus: Option<PrometheusHandle>,
    pub(crate) started_at: DateTime<Utc>,
}

impl AppState {
    pub(crate) fn new(ctx: Arc<AppContext>, prometheus: Option<PrometheusHandle>) -> Self {
        Self {
            ctx,
            prometheus,
            started_at: Utc::now(),
        }
    }
}
