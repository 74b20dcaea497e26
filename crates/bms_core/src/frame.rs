//! Tipos de frame que circulam entre extractor, correlação e decoder.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Tipo de frame reconhecido no barramento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Broadcast anônimo com dados em tempo real (subtipo `0x02`).
    Telemetry,
    /// Broadcast/resposta com endereço do dispositivo e parâmetros (subtipo `0x01`).
    Identity,
    /// Escrita/poll do mestre endereçada a um id (`[id, 0x10, ...]`).
    Command,
}

impl FrameKind {
    pub const ALL: [FrameKind; 3] = [FrameKind::Telemetry, FrameKind::Identity, FrameKind::Command];

    /// Nome curto usado em logs e tópicos.
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Telemetry => "realtime",
            FrameKind::Identity => "settings",
            FrameKind::Command => "command",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame completo recortado do stream. Imutável após a criação.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub bytes: Vec<u8>,
    pub arrival: Instant,
}

impl Frame {
    pub fn new(kind: FrameKind, bytes: Vec<u8>, arrival: Instant) -> Self {
        Self { kind, bytes, arrival }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Frame ao qual a correlação já atribuiu um dispositivo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedFrame {
    pub device_id: u32,
    pub frame: Frame,
}

impl AttributedFrame {
    pub fn kind(&self) -> FrameKind {
        self.frame.kind
    }
}
