//! Thread leitora do link (serial ou gateway TCP) com reconexão.

use crate::serial;
use bms_core::config::{FramingConfig, LinkConfig};
use bms_core::extractor::FrameExtractor;
use bms_core::pipeline::{FrameQueue, pump};
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// Erros ao abrir o link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Falha ao abrir {device}: {source}")]
    Serial {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Endereço inválido {addr}: {reason}")]
    Resolve { addr: String, reason: String },

    #[error("Falha ao conectar em {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Origem dos bytes brutos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSource {
    Serial { device: String, baudrate: u32 },
    Tcp { host: String, port: u16 },
}

impl LinkSource {
    pub fn from_config(cfg: &LinkConfig) -> Self {
        if cfg.mode == "tcp" {
            LinkSource::Tcp {
                host: cfg.host.clone(),
                port: cfg.port,
            }
        } else {
            LinkSource::Serial {
                device: cfg.device.clone(),
                baudrate: cfg.baudrate,
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            LinkSource::Serial { device, baudrate } => format!("USB {device} @ {baudrate}"),
            LinkSource::Tcp { host, port } => format!("TCP {host}:{port}"),
        }
    }

    fn open(&self, timeout: Duration) -> Result<Box<dyn Read + Send>, LinkError> {
        match self {
            LinkSource::Serial { device, baudrate } => {
                let file = serial::open(device, *baudrate).map_err(|source| LinkError::Serial {
                    device: device.clone(),
                    source,
                })?;
                Ok(Box::new(file))
            }
            LinkSource::Tcp { host, port } => {
                let addr = format!("{host}:{port}");
                let resolved = addr
                    .to_socket_addrs()
                    .map_err(|e| LinkError::Resolve {
                        addr: addr.clone(),
                        reason: e.to_string(),
                    })?
                    .next()
                    .ok_or_else(|| LinkError::Resolve {
                        addr: addr.clone(),
                        reason: "nenhum endereço".into(),
                    })?;

                let connect = |source: std::io::Error| LinkError::Connect {
                    addr: addr.clone(),
                    source,
                };
                let stream = TcpStream::connect_timeout(&resolved, timeout).map_err(connect)?;
                stream.set_read_timeout(Some(timeout)).map_err(connect)?;
                Ok(Box::new(stream))
            }
        }
    }
}

fn secs(value: f64, fallback: f64) -> Duration {
    let fallback = Duration::try_from_secs_f64(fallback).unwrap_or(Duration::ZERO);
    if value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(fallback)
    } else {
        fallback
    }
}

/// Inicia a thread leitora. Reconecta para sempre.
///
/// A cada queda o buffer do extractor é esvaziado e um [`LinkEvent::Reset`]
/// vai para a fila, então nada pendente atravessa uma reconexão.
///
/// [`LinkEvent::Reset`]: bms_core::pipeline::LinkEvent::Reset
pub fn spawn_reader(
    link: LinkConfig,
    framing: FramingConfig,
    queue: FrameQueue,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("bms-reader".into())
        .spawn(move || reader_loop(&link, framing, &queue))
}

fn reader_loop(link: &LinkConfig, framing: FramingConfig, queue: &FrameQueue) {
    let source = LinkSource::from_config(link);
    let timeout = secs(link.timeout_secs, 10.0);
    let delay = secs(link.reconnect_delay_secs, 5.0);
    let mut extractor = FrameExtractor::new(framing);

    loop {
        match source.open(timeout) {
            Ok(mut reader) => {
                info!("Link conectado: {}", source.describe());
                match pump(&mut reader, &mut extractor, queue, link.read_buffer, link.debug_raw_log) {
                    Ok(()) => warn!("Link encerrado pelo outro lado: {}", source.describe()),
                    Err(e) => error!("Erro de leitura em {}: {e}", source.describe()),
                }

                let stats = extractor.stats();
                info!(
                    "Frames: {} realtime, {} settings, {} comandos | {} truncagens, {} descartados na fila",
                    stats.telemetry,
                    stats.identity,
                    stats.command,
                    stats.truncations,
                    queue.dropped()
                );
                extractor.reset();
                // Falha também quando pump parou por BrokenPipe
                if !queue.reset() {
                    error!("Consumidor encerrado, parando leitura");
                    return;
                }
            }
            Err(e) => error!("{e}"),
        }

        info!("Tentando novamente em {:.1}s...", delay.as_secs_f64());
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn source_follows_mode() {
        let mut cfg = LinkConfig::default();
        assert!(matches!(LinkSource::from_config(&cfg), LinkSource::Serial { .. }));

        cfg.mode = "tcp".into();
        cfg.host = "10.0.0.2".into();
        assert_eq!(
            LinkSource::from_config(&cfg),
            LinkSource::Tcp {
                host: "10.0.0.2".into(),
                port: 502
            }
        );
        assert_eq!(LinkSource::from_config(&cfg).describe(), "TCP 10.0.0.2:502");
    }

    #[test]
    fn invalid_durations_use_fallback() {
        assert_eq!(secs(-1.0, 5.0), Duration::from_secs(5));
        assert_eq!(secs(f64::NAN, 2.0), Duration::from_secs(2));
        assert_eq!(secs(0.5, 5.0), Duration::from_millis(500));
        assert_eq!(secs(f64::INFINITY, 10.0), Duration::from_secs(10));
        assert_eq!(secs(1e300, 10.0), Duration::from_secs(10));
    }

    #[test]
    fn tcp_source_reads_from_gateway() {
        use std::io::Write;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(&[0x01, 0x10, 0x16, 0x20]).unwrap();
        });

        let source = LinkSource::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let mut reader = source.open(Duration::from_secs(2)).unwrap();
        server.join().unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received, vec![0x01, 0x10, 0x16, 0x20]);
    }

    #[test]
    fn unresolvable_host_is_reported() {
        let source = LinkSource::Tcp {
            host: "".into(),
            port: 0,
        };
        assert!(source.open(Duration::from_millis(100)).is_err());
    }
}
