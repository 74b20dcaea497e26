//! Atribuição de frames anônimos a um dispositivo.
//!
//! Telemetria não carrega id: o próximo frame de identidade funciona como
//! ponto de sincronização e resolve o dono da telemetria mais recente, dentro
//! da janela de expiração. Comandos do mestre ficam retidos até que um frame
//! de identidade atribuído ao mesmo id confirme a resposta.
//!
//! Nenhuma transição falha: ambiguidade vira descarte contado.

use crate::frame::{AttributedFrame, Frame, FrameKind};
use crate::registry::IdField;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Id que o mestre do barramento reporta.
pub const MASTER_ID: u32 = 0;

/// Regra da tabela de decisão que escolheu o alvo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributionRule {
    /// O frame reporta id 0: é sempre o mestre
    SelfReportedMaster,
    /// Nenhum comando dentro da janela: broadcast espontâneo do mestre
    NoRecentCommand,
    /// Atribuído ao último id endereçado por comando
    LastCommanded,
}

/// Decisão de atribuição de um frame de identidade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributionDecision {
    pub target: u32,
    pub rule: AttributionRule,
}

/// Contadores da correlação.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub identities: u64,
    /// Identidades cujo campo de id não coube no frame
    pub identity_unresolved: u64,
    /// Telemetria substituída por outra antes de ser atribuída
    pub telemetry_replaced: u64,
    /// Telemetria mais velha que a janela quando a identidade chegou
    pub telemetry_stale: u64,
    pub telemetry_attributed: u64,
    pub commands_released: u64,
    pub commands_expired: u64,
}

#[derive(Debug, Clone)]
struct Pending {
    bytes: Vec<u8>,
    arrival: Instant,
}

impl Pending {
    fn from_frame(frame: Frame) -> Self {
        Self {
            bytes: frame.bytes,
            arrival: frame.arrival,
        }
    }

    fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.arrival)
    }
}

/// Motor de correlação de um canal. Consumidor sequencial, sem locks.
#[derive(Debug)]
pub struct CorrelationEngine {
    expiry: Duration,
    identity_id: IdField,
    command_target: IdField,
    pending_telemetry: Option<Pending>,
    pending_commands: HashMap<u32, Pending>,
    last_command: Option<(u32, Instant)>,
    stats: CorrelationStats,
}

impl CorrelationEngine {
    pub fn new(expiry: Duration, identity_id: IdField, command_target: IdField) -> Self {
        Self {
            expiry,
            identity_id,
            command_target,
            pending_telemetry: None,
            pending_commands: HashMap::new(),
            last_command: None,
            stats: CorrelationStats::default(),
        }
    }

    pub fn stats(&self) -> &CorrelationStats {
        &self.stats
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Comandos ainda aguardando confirmação.
    pub fn pending_commands(&self) -> usize {
        self.pending_commands.len()
    }

    pub fn has_pending_telemetry(&self) -> bool {
        self.pending_telemetry.is_some()
    }

    /// Descarta todo o estado pendente (reconexão). Os contadores são mantidos.
    pub fn reset(&mut self) {
        self.pending_telemetry = None;
        self.pending_commands.clear();
        self.last_command = None;
    }

    /// Processa um frame. Deve ser chamado na ordem de chegada.
    pub fn process(&mut self, frame: Frame) -> Vec<AttributedFrame> {
        match frame.kind {
            FrameKind::Command => {
                self.on_command(frame);
                Vec::new()
            }
            FrameKind::Telemetry => {
                self.on_telemetry(frame);
                Vec::new()
            }
            FrameKind::Identity => self.on_identity(frame),
        }
    }

    fn on_command(&mut self, frame: Frame) {
        let Some(target) = self.command_target.read(&frame.bytes) else {
            debug!("Comando sem id alvo legível, ignorado");
            return;
        };
        trace!("Comando para o id {target}");
        self.last_command = Some((target, frame.arrival));
        self.pending_commands.insert(target, Pending::from_frame(frame));
    }

    fn on_telemetry(&mut self, frame: Frame) {
        if self.pending_telemetry.replace(Pending::from_frame(frame)).is_some() {
            self.stats.telemetry_replaced += 1;
            debug!("Telemetria pendente substituída sem identidade");
        }
    }

    /// Tabela de decisão, de cima para baixo.
    pub fn decide(&self, self_reported: u32, now: Instant) -> AttributionDecision {
        if self_reported == MASTER_ID {
            return AttributionDecision {
                target: MASTER_ID,
                rule: AttributionRule::SelfReportedMaster,
            };
        }
        match self.last_command {
            Some((target, at)) if now.saturating_duration_since(at) <= self.expiry => {
                AttributionDecision {
                    target,
                    rule: AttributionRule::LastCommanded,
                }
            }
            _ => AttributionDecision {
                target: MASTER_ID,
                rule: AttributionRule::NoRecentCommand,
            },
        }
    }

    fn on_identity(&mut self, frame: Frame) -> Vec<AttributedFrame> {
        let Some(self_reported) = self.identity_id.read(&frame.bytes) else {
            self.stats.identity_unresolved += 1;
            debug!("Identidade sem endereço legível ({} bytes), ignorada", frame.len());
            return Vec::new();
        };
        self.stats.identities += 1;

        let now = frame.arrival;
        let decision = self.decide(self_reported, now);
        debug!(
            "Identidade reporta id {self_reported}, atribuída a {} ({:?})",
            decision.target, decision.rule
        );

        let mut out = Vec::with_capacity(3);

        self.purge_expired_commands(now);
        if let Some(command) = self.pending_commands.remove(&decision.target) {
            self.stats.commands_released += 1;
            out.push(AttributedFrame {
                device_id: decision.target,
                frame: Frame::new(FrameKind::Command, command.bytes, command.arrival),
            });
        }

        out.push(AttributedFrame {
            device_id: decision.target,
            frame,
        });

        if let Some(telemetry) = self.pending_telemetry.take() {
            if telemetry.age_at(now) <= self.expiry {
                self.stats.telemetry_attributed += 1;
                out.push(AttributedFrame {
                    device_id: decision.target,
                    frame: Frame::new(FrameKind::Telemetry, telemetry.bytes, telemetry.arrival),
                });
            } else {
                self.stats.telemetry_stale += 1;
                debug!("Telemetria pendente expirou ({:?})", telemetry.age_at(now));
            }
        }

        out
    }

    fn purge_expired_commands(&mut self, now: Instant) {
        let expiry = self.expiry;
        let before = self.pending_commands.len();
        self.pending_commands.retain(|_, cmd| cmd.age_at(now) <= expiry);
        let purged = before - self.pending_commands.len();
        if purged > 0 {
            self.stats.commands_expired += purged as u64;
            debug!("{purged} comando(s) expirado(s) sem resposta");
        }
    }
}
