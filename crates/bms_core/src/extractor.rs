//! Recorte de frames a partir do stream bruto do barramento RS485.
//!
//! Dois formatos dividem o mesmo canal:
//!
//! ```text
//! Broadcast JK:  ┌ 55 AA EB 90 ┬ Subtipo(1) ┬ ...  (308 ou 300 bytes no total)
//! Comando mestre: ┌ Id(1) ┬ 0x10 ┬ ...            (11 bytes no total)
//! ```
//!
//! O marcador que aparece primeiro no buffer vence e é processado até o fim
//! antes de voltar a procurar, então os frames saem na ordem do stream.

use crate::config::FramingConfig;
use crate::frame::{Frame, FrameKind};
use std::time::Instant;
use tracing::{debug, trace};

/// Contadores do extractor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub telemetry: u64,
    pub identity: u64,
    pub command: u64,
    /// Broadcasts com subtipo desconhecido, consumidos e descartados
    pub unknown_subtype: u64,
    /// Vezes em que o buffer sem marcador foi truncado
    pub truncations: u64,
    pub bytes_discarded: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Broadcast(usize),
    Command(usize),
}

/// Extractor com estado sobre um único buffer crescente.
#[derive(Debug)]
pub struct FrameExtractor {
    config: FramingConfig,
    buffer: Vec<u8>,
    stats: ExtractorStats,
}

impl FrameExtractor {
    pub fn new(config: FramingConfig) -> Self {
        Self {
            config,
            buffer: Vec::with_capacity(4096),
            stats: ExtractorStats::default(),
        }
    }

    /// Anexa `chunk` e devolve os frames completos, carimbados com `Instant::now()`.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.feed_at(chunk, Instant::now())
    }

    /// Como [`feed`](Self::feed), com timestamp explícito.
    ///
    /// O iterador é preguiçoso: cada frame só é recortado quando puxado.
    /// Frames não puxados continuam no buffer para a próxima chamada.
    pub fn feed_at(&mut self, chunk: &[u8], at: Instant) -> Frames<'_> {
        self.buffer.extend_from_slice(chunk);
        Frames { extractor: self, at }
    }

    /// Esvazia o buffer (reconexão). Os contadores são mantidos.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes ainda aguardando um frame completo.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> &ExtractorStats {
        &self.stats
    }

    fn next_frame(&mut self, at: Instant) -> Option<Frame> {
        loop {
            let Some(marker) = self.find_marker() else {
                self.truncate_garbage();
                return None;
            };

            let (start, kind, len) = match marker {
                Marker::Broadcast(idx) => {
                    let subtype_at = idx + self.config.magic.len();
                    if self.buffer.len() <= subtype_at {
                        return None;
                    }
                    let subtype = self.buffer[subtype_at];
                    let (kind, len) = self.classify_subtype(subtype);
                    (idx, kind, len)
                }
                Marker::Command(idx) => (idx, Some(FrameKind::Command), self.config.command_len),
            };

            let end = start + len;
            if self.buffer.len() < end {
                // Frame incompleto: espera mais bytes sem descartar o marcador
                return None;
            }

            let bytes = self.buffer[start..end].to_vec();
            self.buffer.drain(..end);

            match kind {
                Some(kind) => {
                    match kind {
                        FrameKind::Telemetry => self.stats.telemetry += 1,
                        FrameKind::Identity => self.stats.identity += 1,
                        FrameKind::Command => self.stats.command += 1,
                    }
                    trace!("Frame {kind} recortado ({} bytes, {start} bytes de lixo antes)", bytes.len());
                    return Some(Frame::new(kind, bytes, at));
                }
                None => {
                    self.stats.unknown_subtype += 1;
                    debug!("Broadcast com subtipo desconhecido 0x{:02X} descartado", bytes[self.config.magic.len()]);
                }
            }
        }
    }

    fn classify_subtype(&self, subtype: u8) -> (Option<FrameKind>, usize) {
        if subtype == self.config.telemetry_subtype {
            (Some(FrameKind::Telemetry), self.config.telemetry_len)
        } else if subtype == self.config.identity_subtype {
            (Some(FrameKind::Identity), self.config.identity_len)
        } else {
            (None, self.config.identity_len)
        }
    }

    fn find_marker(&self) -> Option<Marker> {
        let broadcast = self.find_magic();
        // Só precisa procurar comandos antes do broadcast encontrado
        let limit = broadcast.unwrap_or(self.buffer.len());
        let command = self.find_command(limit);

        match (broadcast, command) {
            (Some(b), Some(c)) if c < b => Some(Marker::Command(c)),
            (Some(b), _) => Some(Marker::Broadcast(b)),
            (None, Some(c)) => Some(Marker::Command(c)),
            (None, None) => None,
        }
    }

    fn find_magic(&self) -> Option<usize> {
        let magic = &self.config.magic[..];
        if magic.is_empty() || self.buffer.len() < magic.len() {
            return None;
        }
        self.buffer.windows(magic.len()).position(|w| w == magic)
    }

    fn find_command(&self, limit: usize) -> Option<usize> {
        let end = (limit + 1).min(self.buffer.len());
        self.buffer[..end]
            .windows(2)
            .position(|w| w[0] <= self.config.max_target_id && w[1] == self.config.command_opcode)
    }

    fn truncate_garbage(&mut self) {
        if self.buffer.len() <= self.config.buffer_cap {
            return;
        }
        let drop = self.buffer.len() - self.config.retain_tail.min(self.buffer.len());
        self.buffer.drain(..drop);
        self.stats.truncations += 1;
        self.stats.bytes_discarded += drop as u64;
        debug!("Nenhum marcador em {} bytes, descartando prefixo de {drop} bytes", drop + self.buffer.len());
    }
}

/// Sequência preguiçosa de frames devolvida por [`FrameExtractor::feed`].
pub struct Frames<'a> {
    extractor: &'a mut FrameExtractor,
    at: Instant,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        self.extractor.next_frame(self.at)
    }
}
