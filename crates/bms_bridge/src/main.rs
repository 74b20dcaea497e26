//! # JK BMS Bridge
//!
//! Escuta o barramento RS485 dos JK BMS em paralelo (dongle USB ou gateway
//! Modbus TCP), atribui cada frame a um dispositivo e repassa os registros
//! decodificados para o sink configurado (log ou UDP).
//!
//! ## Uso
//! ```bash
//! bms_bridge                     # config.toml ao lado do executável
//! bms_bridge /etc/bms/config.toml
//! RUST_LOG=bms_core=debug bms_bridge
//! ```

mod serial;
mod sinks;
mod transport;

use bms_core::config::AppConfig;
use bms_core::pipeline::{Pipeline, frame_queue, spawn_consumer};
use bms_core::registry::Registry;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);

    // ── Config (logado com subscriber temporário) ──
    let config = tracing::subscriber::with_default(tracing_subscriber::fmt().finish(), || {
        AppConfig::load(&config_path)
    });

    // ── Logging ──
    let default_filter = if config.link.debug_raw_log { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("Configuração inválida: {e}");
        }
        return ExitCode::FAILURE;
    }

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    let registry = match load_registry(&config.registry_path) {
        Ok(registry) => registry,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let source = transport::LinkSource::from_config(&config.link);

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   🔋 JK BMS BRIDGE – ATIVO (Rust)");
    println!("══════════════════════════════════════════════");
    println!("  Link:      {}", source.describe());
    println!("  Expiração: {:.1}s", config.correlation.expiry_secs);
    println!("  Fila:      {} frames", config.correlation.queue_depth);
    println!("  Sink:      {}", config.sink.mode);
    println!("══════════════════════════════════════════════");
    println!();

    let sink = match sinks::build(&config.sink) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Falha ao criar sink: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (queue, rx) = frame_queue(config.correlation.queue_depth);
    let pipeline = Pipeline::from_config(&config.correlation, registry, sink);

    let consumer = match spawn_consumer(pipeline, rx) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Falha ao criar thread consumidora: {e}");
            return ExitCode::FAILURE;
        }
    };

    let reader = match transport::spawn_reader(config.link.clone(), config.framing.clone(), queue) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Falha ao criar thread leitora: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("Bridge iniciado");

    // A leitora só termina se o consumidor tiver encerrado
    if reader.join().is_err() {
        error!("Thread leitora terminou com pânico");
    }
    match consumer.join() {
        Ok(pipeline) => {
            info!("{} registros publicados", pipeline.published());
            ExitCode::SUCCESS
        }
        Err(_) => {
            error!("Thread consumidora terminou com pânico");
            ExitCode::FAILURE
        }
    }
}

fn load_registry(path: &str) -> Result<Registry, bms_core::registry::RegistryError> {
    if path.is_empty() {
        info!("Usando registro embutido JK PB2A16S30P");
        return Ok(Registry::jk_pb2a16s30p());
    }
    Registry::load(Path::new(path))
}
