use anyhow::Context;
use relay_core::{
    config::RuntimeConfig,
    runtime::{run_loop, AllowlistGate, EchoHandler, LoopOptions},
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_core::logging::init("relay")?;

    let cfg = RuntimeConfig::load().context("load runtime config")?;
    if cfg.enable_memory_hook {
        warn!("CHANNEL_ENABLE_MEMORY_HOOK is set but no memory backend is linked; replies carry no memory notes");
    }

    let mut adapter =
        relay_telegram::adapter_from_config(&cfg).context("build telegram adapter")?;
    let handler = AllowlistGate::new(EchoHandler::new(), &cfg.allowed_chat_ids);
    let opts = LoopOptions::from_config(&cfg);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested; finishing current cycle");
            on_signal.cancel();
        }
    });

    info!(
        ack_policy = opts.ack_policy.as_str(),
        once = opts.once,
        live_mode = cfg.live_mode,
        allow_list = cfg.allowed_chat_ids.len(),
        "relay starting"
    );

    let last = run_loop(&mut adapter, &handler, None, &opts, cancel, |_| {}).await;

    if opts.once {
        if let Some(report) = last {
            let line = report.to_json_line().context("serialize cycle report")?;
            println!("{line}");
            if !report.result.is_ok() {
                anyhow::bail!("cycle failed: {}", report.result.reason.as_str());
            }
        }
    }
    Ok(())
}
