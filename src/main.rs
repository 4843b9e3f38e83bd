use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use network::transport::UdpTransport;
use settings_manager::{parse_zone_tuple, ConfigManager};
use soundstage::scheduler::FrameScheduler;
use soundstage::MixerConfig;

/// soundstage - spatial audio mixer for virtual worlds
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Socket address to bind for client datagrams
    #[clap(short, long)]
    bind: Option<String>,

    /// Unattenuated zone pair as twelve comma-separated floats:
    /// source corner, source dimensions, listener corner, listener
    /// dimensions
    #[clap(long, value_name = "FLOATS")]
    unattenuated_zone: Option<String>,

    /// Enable dynamic jitter buffers
    #[clap(long)]
    dynamic_jitter_buffer: bool,

    /// Enable debug logging
    #[clap(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let mut config_manager = ConfigManager::new().context("loading configuration")?;
    let settings = config_manager.settings_mut();

    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }
    if let Some(zone) = &args.unattenuated_zone {
        let floats = parse_zone_tuple(zone).context("parsing unattenuated zone")?;
        settings.unattenuated_zone = Some(floats.to_vec());
    }
    if args.dynamic_jitter_buffer {
        settings.dynamic_jitter_buffers = true;
    }

    let settings = config_manager.settings();
    let mixer_config = MixerConfig::from_settings(settings).context("building mixer config")?;

    if let Some(zones) = &mixer_config.zones {
        let source_center = zones.source.center();
        let listener_center = zones.listener.center();
        info!(
            "unattenuated zone configured: source box centered at {}, {}, {}",
            source_center.x, source_center.y, source_center.z
        );
        info!(
            "sources inside it play unattenuated to listeners in a box centered at {}, {}, {}",
            listener_center.x, listener_center.y, listener_center.z
        );
    }
    if mixer_config.dynamic_jitter_buffers {
        info!("dynamic jitter buffers enabled");
    } else {
        info!("dynamic jitter buffers disabled");
    }

    let bind_addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", settings.bind_addr))?;
    let transport = UdpTransport::bind(bind_addr, settings.accept_unregistered)
        .await
        .context("binding mixer transport")?;

    let mut scheduler = FrameScheduler::new(transport, mixer_config);

    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            stop.store(true, Ordering::Relaxed);
        }
    });

    scheduler.run().await;
    Ok(())
}
