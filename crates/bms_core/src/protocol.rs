//! Formato binário dos registros publicados pelo bridge via UDP.
//!
//! ```text
//! ┌──────────┬─────────┬──────────────────────────────┐
//! │ Magic(1) │ Ver.(1) │ bincode(AttributedRecord)    │
//! └──────────┴─────────┴──────────────────────────────┘
//! ```

use crate::decoder::DecodedFields;
use crate::frame::FrameKind;
use serde::{Deserialize, Serialize};

/// Magic byte dos registros do bridge ('B').
pub const MAGIC_BYTE: u8 = 0x42;

/// Versão atual do protocolo.
pub const PROTOCOL_VERSION: u8 = 1;

/// Tamanho do header (magic + version).
const HEADER_SIZE: usize = 2;

/// Erros do protocolo.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Pacote muito curto ({0} bytes, mínimo {HEADER_SIZE})")]
    TooShort(usize),

    #[error("Magic byte inválido: 0x{0:02X} (esperado 0x{MAGIC_BYTE:02X})")]
    InvalidMagic(u8),

    #[error("Versão incompatível: {0} (suportada: {PROTOCOL_VERSION})")]
    VersionMismatch(u8),

    #[error("Erro de serialização: {0}")]
    Serialize(String),

    #[error("Erro de deserialização: {0}")]
    Deserialize(String),
}

/// Registro atribuído e decodificado, como sai do bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedRecord {
    pub device_id: u32,
    pub kind: FrameKind,
    /// Momento da publicação (ms desde a época Unix)
    pub unix_ms: u64,
    pub fields: DecodedFields,
}

/// Codifica um [`AttributedRecord`]: `[MAGIC][VERSION][bincode...]`.
pub fn encode_record(record: &AttributedRecord) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(record).map_err(|e| ProtocolError::Serialize(e.to_string()))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.push(MAGIC_BYTE);
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&body);

    Ok(frame)
}

/// Decodifica bytes recebidos em [`AttributedRecord`].
///
/// Valida magic byte e versão antes de deserializar.
pub fn decode_record(data: &[u8]) -> Result<AttributedRecord, ProtocolError> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::TooShort(data.len()));
    }

    let magic = data[0];
    if magic != MAGIC_BYTE {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let version = data[1];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch(version));
    }

    bincode::deserialize(&data[HEADER_SIZE..]).map_err(|e| ProtocolError::Deserialize(e.to_string()))
}
