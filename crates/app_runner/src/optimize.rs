use core_types::{PricingError, SpaceSnapshot};
use serde::{Deserialize, Serialize};

use crate::state::AppContext;

pub(crate) const STATUS_EXPLORED: &str = "explored";
pub(crate) const STATUS_EXPLOITED: &str = "exploited";

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct OptimizeRequest {
    pub(crate) id: String,
    pub(crate) price: f64,
    pub(crate) floor_price: f64,
    pub(crate) data_center: String,
    pub(crate) app_publisher_id: String,
    pub(crate) bundle_id: String,
    pub(crate) tag_id: String,
    pub(crate) device_geo_country: String,
    pub(crate) ext_ad_format: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct OptimizeResponse {
    pub(crate) optimized_price: f64,
    pub(crate) status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct FeedbackRequest {
    pub(crate) id: String,
    pub(crate) impression: bool,
    pub(crate) price: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FeedbackResponse {
    pub(crate) ack: bool,
}

/// 64-bit FNV-1a over the concatenated parts.
pub(crate) fn fnv1a64(parts: &[&str]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in parts.iter().flat_map(|p| p.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

impl OptimizeRequest {
    pub(crate) fn validate(&self) -> Result<(), PricingError> {
        if !(self.floor_price > 0.0) || !(self.price > 0.0) || self.floor_price > self.price {
            return Err(PricingError::Validation);
        }
        Ok(())
    }

    /// Decimal context key. The ad format goes in twice and the publisher
    /// not at all, matching the keys in existing space description files.
    pub(crate) fn context_hash(&self) -> String {
        fnv1a64(&[
            self.data_center.as_str(),
            self.bundle_id.as_str(),
            self.tag_id.as_str(),
            self.device_geo_country.as_str(),
            self.ext_ad_format.as_str(),
            self.ext_ad_format.as_str(),
        ])
        .to_string()
    }
}

/// Explore if the sampler accepts, otherwise exploit. Errors echo the bid
/// price back with the error text as status.
pub(crate) fn optimize(ctx: &AppContext, req: &OptimizeRequest) -> OptimizeResponse {
    match try_optimize(ctx, req) {
        Ok(resp) => resp,
        Err(err) => {
            tracing::debug!(id = %req.id, error = %err, "optimize rejected");
            metrics::counter!("optimizer.request.error").increment(1);
            OptimizeResponse {
                optimized_price: req.price,
                status: err.to_string(),
            }
        }
    }
}

fn try_optimize(ctx: &AppContext, req: &OptimizeRequest) -> Result<OptimizeResponse, PricingError> {
    req.validate()?;
    let context = req.context_hash();
    let space = ctx.space(&context).ok_or(PricingError::NoSpace)?;

    if let Some(exploration) = space.explore(req.floor_price, req.price)? {
        ctx.track_exploration(
            req.id.clone(),
            exploration.record,
            exploration.ttl,
            space.clone(),
        );
        metrics::counter!("optimizer.explore.accepted").increment(1);
        return Ok(OptimizeResponse {
            optimized_price: exploration.price,
            status: STATUS_EXPLORED.to_string(),
        });
    }

    metrics::counter!("optimizer.explore.declined").increment(1);
    let price = space.exploit(req.floor_price, req.price)?;
    metrics::counter!("optimizer.exploit.ok").increment(1);
    Ok(OptimizeResponse {
        optimized_price: price,
        status: STATUS_EXPLOITED.to_string(),
    })
}

/// Settles the pending exploration for `req.id`, if it has not expired yet.
pub(crate) fn feedback(ctx: &AppContext, req: &FeedbackRequest) -> FeedbackResponse {
    let Some(record) = ctx.pending.pop(&req.id) else {
        metrics::counter!("optimizer.feedback.miss").increment(1);
        return FeedbackResponse { ack: false };
    };
    let Some(space) = ctx.space(&record.context_hash) else {
        tracing::warn!(id = %req.id, context = %record.context_hash, "pending record for unknown space");
        metrics::counter!("optimizer.feedback.miss").increment(1);
        return FeedbackResponse { ack: false };
    };
    space.update(&record, req.impression);
    metrics::counter!("optimizer.feedback.ack").increment(1);
    FeedbackResponse { ack: true }
}

pub(crate) fn space_snapshot(ctx: &AppContext, context_hash: &str) -> SpaceSnapshot {
    ctx.space(context_hash)
        .map(|space| space.snapshot())
        .unwrap_or_default()
}
