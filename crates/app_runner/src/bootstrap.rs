use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use calibration::{default_calibrator, spawn_calibration_loop};
use core_types::{PricingConfig, SpaceDesc};
use observability::{init_metrics, init_tracing};
use price_space::PriceSpace;
use tokio::task::JoinHandle;

use crate::config_loader::{load_app_config, AppConfig};
use crate::control_api;
use crate::state::{AppContext, AppState};

pub(super) async fn async_main() -> Result<()> {
    let cfg = load_app_config()?;
    let _guard = init_tracing("app_runner", Some(&cfg.log_level));
    let prometheus = init_metrics()?;
    tracing::info!(?cfg, "config loaded");

    let descs = load_space_descs(&cfg.space_desc_file)?;
    let ctx = Arc::new(build_context(&descs, &cfg.pricing)?);
    let background = spawn_background(&ctx, &cfg);

    let app = control_api::build_router(AppState::new(ctx.clone(), Some(prometheus)));
    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen_addr {}", cfg.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, spaces = ctx.spaces.len(), "optimizer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    tracing::info!(pending = ctx.pending.len(), "optimizer stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(?err, "ctrl-c handler failed");
    }
    tracing::info!("shutdown requested");
}

pub(crate) fn load_space_descs(path: &Path) -> Result<Vec<SpaceDesc>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read space descriptions {}", path.display()))?;
    let descs: Vec<SpaceDesc> = serde_json::from_str(&raw)
        .with_context(|| format!("decode space descriptions {}", path.display()))?;
    tracing::debug!(count = descs.len(), "space descriptions loaded");
    Ok(descs)
}

/// Any invalid description aborts startup rather than serving a partial set.
pub(crate) fn build_context(descs: &[SpaceDesc], pricing: &PricingConfig) -> Result<AppContext> {
    let mut spaces = HashMap::with_capacity(descs.len());
    for desc in descs {
        let space = PriceSpace::new(desc, pricing)
            .with_context(|| format!("build price space {}", desc.context_hash))?;
        if spaces
            .insert(desc.context_hash.clone(), Arc::new(space))
            .is_some()
        {
            bail!("duplicate context_hash {}", desc.context_hash);
        }
    }
    Ok(AppContext::new(spaces))
}

/// Expiry sweep plus one calibration loop per space.
pub(crate) fn spawn_background(ctx: &AppContext, cfg: &AppConfig) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(ctx.spaces.len() + 1);
    handles.push(ctx.pending.spawn_sweeper(cfg.sweep_interval));

    let calibrator = default_calibrator(cfg.lightgbm_path.clone());
    for space in ctx.spaces.values() {
        handles.push(spawn_calibration_loop(
            space,
            calibrator.clone(),
            cfg.calibration.clone(),
        ));
    }
    tracing::info!(
        spaces = ctx.spaces.len(),
        sweep_ms = cfg.sweep_interval.as_millis() as u64,
        calibrator = calibrator.name(),
        "background tasks started"
    );
    handles
}
