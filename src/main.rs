mod args;
mod config;
mod logging;

use std::sync::Arc;

use clap::Parser;
use nat64session::transport::{Ipv4Transport, Ipv6Transport, Protocol, Tuple};
use nat64session::Engine;

use args::Args;
use config::Config;

fn main() {
    let args = Args::parse();
    logging::enable_logger(args.verbose);

    let config = Config::load(&args.config_file).unwrap_or_else(|err| {
        log::error!("Failed to load {}: {err}", args.config_file.display());
        std::process::exit(1);
    });

    let engine = Arc::new(Engine::new(config.engine_options()));

    for addr in &config.pool {
        if let Err(err) = engine.pool_add(*addr) {
            log::warn!("Failed to register {addr} in the pool: {err}");
        }
    }

    for binding in &config.static_bindings {
        if let Err(err) = engine.bib_add_static(binding.protocol, binding.v6, binding.v4) {
            log::warn!("Failed to install static binding {} <-> {}: {err}", binding.v6, binding.v4);
        }
    }

    let expirer = engine.spawn_expirer();
    log::info!(
        "Engine running with {} pool address(es) and {} static binding(s)",
        config.pool.len(),
        config.static_bindings.len()
    );

    run_demo(&engine);

    expirer.stop();
}

/// Since this binary never opens a TUN device or parses real packets, it
/// drives the engine's packet-path API directly with a scripted flow so the
/// core's behavior can be observed end to end.
fn run_demo(engine: &Engine) {
    let outbound = Tuple::V6 {
        protocol: Protocol::Udp,
        src: Ipv6Transport::new("2001:db8::1".parse().unwrap(), 40001),
        dst: Ipv6Transport::new("64:ff9b::c000:0201".parse().unwrap(), 53),
        dst_v4: Ipv4Transport::new("192.0.2.1".parse().unwrap(), 53),
    };
    let (v4_local, v4_remote) = match engine.handle_outbound_v6(outbound, None) {
        Ok(translated) => {
            log::info!("Outbound UDP flow translated: {} -> {}", translated.0, translated.1);
            translated
        }
        Err(err) => {
            log::warn!("Outbound UDP flow rejected: {err}");
            return;
        }
    };

    let inbound = Tuple::V4 {
        protocol: Protocol::Udp,
        src: v4_remote,
        dst: v4_local,
        src_v6: Ipv6Transport::new("64:ff9b::c000:0201".parse().unwrap(), 53),
    };
    match engine.handle_inbound_v4(inbound, None) {
        Ok((v6_local, v6_remote)) => log::info!("Reply translated back to [{v6_local}] from [{v6_remote}]"),
        Err(err) => log::warn!("Inbound reply rejected: {err}"),
    }

    for entry in engine.bib_list(Protocol::Udp) {
        log::debug!("BIB entry: {} <-> {}", entry.v6, entry.v4);
    }
}
