//! # BMS Core
//!
//! Núcleo do sniffer do barramento RS485 dos JK BMS em paralelo: recorta
//! frames de dois protocolos intercalados no mesmo canal, atribui a
//! telemetria anônima a um dispositivo e decodifica os campos registrados.
//!
//! ## Módulos
//! - [`extractor`] – Recorte de frames do stream bruto
//! - [`correlation`] – Atribuição de telemetria/comandos a um id
//! - [`registry`] – Registro declarativo de campos
//! - [`decoder`] – Decodificação pura de campos
//! - [`pipeline`] – Fila limitada leitor → consumidor
//! - [`sink`] – Interface do consumidor final
//! - [`protocol`] – Formato binário dos registros publicados
//! - [`config`] – Configuração unificada via TOML

pub mod config;
pub mod correlation;
pub mod decoder;
pub mod extractor;
pub mod frame;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod sink;

// Re-exports convenientes
pub use config::AppConfig;
pub use correlation::CorrelationEngine;
pub use decoder::{DecodedFields, Value, decode};
pub use extractor::FrameExtractor;
pub use frame::{AttributedFrame, Frame, FrameKind};
pub use pipeline::{FrameQueue, LinkEvent, Pipeline, PushOutcome};
pub use protocol::{AttributedRecord, PROTOCOL_VERSION, decode_record, encode_record};
pub use registry::Registry;
pub use sink::Sink;
