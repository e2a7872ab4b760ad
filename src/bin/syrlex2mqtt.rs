//! syrlex2mqtt - answer SYR softener cloud polls locally and publish to MQTT.
//!
//! This daemon:
//! 1. Connects to the MQTT broker with a retained `offline` last will
//! 2. Serves GetBasicCommands / GetAllCommands over HTTP (and HTTPS)
//! 3. Publishes Home Assistant discovery and state per device
//! 4. Queues Home Assistant commands for the next device poll

use anyhow::{Context, Result};
use clap::Parser;
use rumqttc::v5::mqttbytes::QoS;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use syrlex2mqtt::api::{tls::load_server_config, HttpDeviceProxy, HttpServer, RequestRouter};
use syrlex2mqtt::config::BridgeConfig;
use syrlex2mqtt::device::DeviceRegistry;
use syrlex2mqtt::topics::{BRIDGE_STATE_TOPIC, PAYLOAD_OFFLINE};
use syrlex2mqtt::transport::{connect_mqtt, run_event_loop, MqttPublisher, Publisher};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bridge SYR LEX Plus water softeners to MQTT with Home Assistant discovery"
)]
struct Args {
    /// Path to a JSON config file. Environment variables override it.
    #[arg(long, env = "SYR_CONFIG")]
    config: Option<PathBuf>,

    /// Log request/response envelopes and state payloads.
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let loaded = BridgeConfig::load_from(args.config.as_deref());

    let verbose = args.verbose || loaded.as_ref().map(|cfg| cfg.verbose).unwrap_or(false);
    let filter = if verbose {
        "info,syrlex2mqtt=debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let cfg = match loaded {
        Ok(cfg) => cfg,
        Err(err) => {
            log::error!("configuration error: {:#}", err);
            std::process::exit(1);
        }
    };
    run(cfg)
}

fn run(cfg: BridgeConfig) -> Result<()> {
    let commands = cfg.command_set();
    if !commands.extra_properties().is_empty() {
        log::info!(
            "Additional properties: {}",
            commands.extra_properties().join(", ")
        );
    }

    let settings = cfg.mqtt_settings()?;
    let (client, connection) = connect_mqtt(&settings)?;
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher::new(client.clone()));
    let registry = Arc::new(DeviceRegistry::new(publisher, commands));

    let shutdown = Arc::new(AtomicBool::new(false));
    let mqtt_thread = {
        let client = client.clone();
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            run_event_loop(&client, connection, shutdown, |topic, payload| {
                registry.handle_command(topic, payload);
            })
        })
    };

    let mut router = RequestRouter::new(registry.clone());
    if cfg.http.proxy_basic_commands {
        log::info!("GetBasicCommands will be proxied to the requesting device");
        router = router.with_proxy(Box::new(HttpDeviceProxy::new()));
    }
    let router = Arc::new(router);

    let mut servers = vec![HttpServer::new(cfg.http_addr(), router.clone()).spawn()?];
    if let (Some(cert), Some(key)) = (&cfg.http.tls_cert_path, &cfg.http.tls_key_path) {
        let tls = load_server_config(cert, key)?;
        servers.push(
            HttpServer::new(cfg.https_addr(), router.clone())
                .with_tls(tls)
                .spawn()?,
        );
    } else {
        log::info!("TLS_CERT_PATH/TLS_KEY_PATH not set, HTTPS disabled");
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("syrlex2mqtt running, waiting for devices (Ctrl-C to stop)");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping");

    if let Err(err) = client.try_publish(
        BRIDGE_STATE_TOPIC,
        QoS::AtLeastOnce,
        true,
        PAYLOAD_OFFLINE.as_bytes().to_vec(),
    ) {
        log::warn!("failed to publish offline state: {}", err);
    }
    for server in servers {
        server.stop()?;
    }
    shutdown.store(true, Ordering::SeqCst);
    if let Err(err) = client.try_disconnect() {
        log::warn!("MQTT disconnect failed: {}", err);
    }
    if mqtt_thread.join().is_err() {
        log::warn!("MQTT event loop thread panicked");
    }
    log::info!("{} device(s) seen this session", registry.len());
    Ok(())
}
