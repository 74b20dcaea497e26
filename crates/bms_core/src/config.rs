//! Configuração unificada via TOML.
//!
//! Um único `config.toml` cobre o link, o enquadramento, a correlação e o sink.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Configuração do link físico (lido pelo bridge, não pelo core).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Modo: "serial" (dongle RS485 USB) ou "tcp" (gateway Modbus)
    pub mode: String,
    /// Dispositivo serial
    pub device: String,
    /// Baud rate do barramento
    pub baudrate: u32,
    /// Host do gateway TCP
    pub host: String,
    /// Porta do gateway TCP
    pub port: u16,
    /// Timeout de conexão/leitura (segundos)
    pub timeout_secs: f64,
    /// Tamanho do buffer de leitura
    pub read_buffer: usize,
    /// Espera entre tentativas de reconexão (segundos)
    pub reconnect_delay_secs: f64,
    /// Loga cada chunk bruto em hex (nível debug)
    pub debug_raw_log: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            mode: "serial".into(),
            device: "/dev/ttyUSB0".into(),
            baudrate: 115200,
            host: String::new(),
            port: 502,
            timeout_secs: 10.0,
            read_buffer: 4096,
            reconnect_delay_secs: 5.0,
            debug_raw_log: false,
        }
    }
}

/// Constantes de enquadramento do barramento.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    /// Marcador dos broadcasts JK
    pub magic: [u8; 4],
    pub telemetry_subtype: u8,
    pub identity_subtype: u8,
    /// Tamanho total do frame de telemetria (inclui o marcador)
    pub telemetry_len: usize,
    /// Tamanho total do frame de identidade (inclui o marcador)
    pub identity_len: usize,
    /// Segundo byte do marcador de comando
    pub command_opcode: u8,
    pub command_len: usize,
    /// Maior id aceito como primeiro byte de um marcador de comando
    pub max_target_id: u8,
    /// Acima disso, sem marcador, o buffer é truncado
    pub buffer_cap: usize,
    /// Bytes finais mantidos após a truncagem
    pub retain_tail: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            magic: [0x55, 0xAA, 0xEB, 0x90],
            telemetry_subtype: 0x02,
            identity_subtype: 0x01,
            telemetry_len: 308,
            identity_len: 300,
            command_opcode: 0x10,
            command_len: 11,
            max_target_id: 15,
            buffer_cap: 2048,
            retain_tail: 1024,
        }
    }
}

/// Parâmetros da correlação e da fila entre leitor e consumidor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Idade máxima de telemetria/comando pendente (segundos)
    pub expiry_secs: f64,
    /// Profundidade da fila de frames
    pub queue_depth: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 2.0,
            queue_depth: 500,
        }
    }
}

impl CorrelationConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs_f64(self.expiry_secs.max(0.0))
    }
}

/// Configuração do sink de saída.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Modo: "log" ou "udp"
    pub mode: String,
    /// Destino UDP (host:porta)
    pub dest: String,
    /// Intervalo mínimo entre publicações de settings por dispositivo (segundos)
    pub settings_publish_interval_secs: f64,
    /// Publica também os comandos do mestre
    pub publish_commands: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: "log".into(),
            dest: "127.0.0.1:5006".into(),
            settings_publish_interval_secs: 60.0,
            publish_commands: false,
        }
    }
}

/// Configuração raiz do aplicativo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Registro de campos em TOML (vazio = registro embutido do PB2A16S30P)
    pub registry_path: String,
    pub link: LinkConfig,
    pub framing: FramingConfig,
    pub correlation: CorrelationConfig,
    pub sink: SinkConfig,
}

const MAX_LINK_SECS: f64 = 3600.0;
const MAX_SETTINGS_INTERVAL_SECS: f64 = 86_400.0;

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(path, content).map_err(|e| e.to_string())?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.link.mode.as_str() {
            "serial" => {
                if self.link.device.is_empty() {
                    errors.push("Modo serial sem dispositivo".into());
                }
            }
            "tcp" => {
                if self.link.host.is_empty() {
                    errors.push("Modo TCP sem host".into());
                }
                if self.link.port == 0 {
                    errors.push("Porta TCP não pode ser 0".into());
                }
            }
            other => errors.push(format!("Modo de link inválido: {other} (serial | tcp)")),
        }
        if !(self.link.timeout_secs > 0.0 && self.link.timeout_secs <= MAX_LINK_SECS) {
            errors.push(format!(
                "Timeout inválido: {} (0–{MAX_LINK_SECS})",
                self.link.timeout_secs
            ));
        }
        if !(self.link.reconnect_delay_secs > 0.0 && self.link.reconnect_delay_secs <= MAX_LINK_SECS) {
            errors.push(format!(
                "Intervalo de reconexão inválido: {} (0–{MAX_LINK_SECS})",
                self.link.reconnect_delay_secs
            ));
        }
        if self.link.read_buffer == 0 {
            errors.push("Buffer de leitura não pode ser 0".into());
        }

        let framing = &self.framing;
        let header = framing.magic.len() + 1;
        if framing.telemetry_len < header || framing.identity_len < header {
            errors.push(format!("Frames de broadcast precisam de pelo menos {header} bytes"));
        }
        if framing.telemetry_subtype == framing.identity_subtype {
            errors.push("Subtipos de telemetria e identidade são iguais".into());
        }
        if framing.command_len < 2 {
            errors.push("Frame de comando precisa de pelo menos 2 bytes".into());
        }
        if framing.retain_tail > framing.buffer_cap {
            errors.push(format!(
                "retain_tail ({}) maior que buffer_cap ({})",
                framing.retain_tail, framing.buffer_cap
            ));
        }

        if !(self.correlation.expiry_secs > 0.0 && self.correlation.expiry_secs <= 60.0) {
            errors.push(format!(
                "Expiração inválida: {} (0–60.0)",
                self.correlation.expiry_secs
            ));
        }
        if self.correlation.queue_depth == 0 {
            errors.push("Profundidade da fila não pode ser 0".into());
        }

        let interval = self.sink.settings_publish_interval_secs;
        if !(0.0..=MAX_SETTINGS_INTERVAL_SECS).contains(&interval) {
            errors.push(format!(
                "Intervalo de settings inválido: {interval} (0–{MAX_SETTINGS_INTERVAL_SECS})"
            ));
        }

        match self.sink.mode.as_str() {
            "log" => {}
            "udp" => {
                if self.sink.dest.is_empty() {
                    errors.push("Sink UDP sem destino".into());
                }
            }
            other => errors.push(format!("Modo de sink inválido: {other} (log | udp)")),
        }

        errors
    }
}
