//! Registro declarativo de campos por tipo de frame.
//!
//! Cada campo é um [`FieldDef`] com offset, largura, ordem de bytes e escala.
//! O registro embutido descreve o JK PB2A16S30P; um registro próprio pode
//! ser carregado de um arquivo TOML com [`Registry::load`].

use crate::frame::FrameKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Erros ao carregar um registro.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Erro ao ler {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Erro ao parsear registro: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Campo duplicado em {kind}: {name}")]
    DuplicateField { kind: FrameKind, name: String },

    #[error("Campo {name} em {kind}: {digits} dígitos hex (máximo {MAX_HEX_DIGITS})")]
    HexTooWide {
        kind: FrameKind,
        name: String,
        digits: usize,
    },
}

/// Um valor de 64 bits cabe em 16 dígitos hex.
pub const MAX_HEX_DIGITS: usize = 16;

/// Codificação numérica de um campo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    U8,
    U16,
    I16,
    U32,
    I32,
}

impl Encoding {
    pub fn width(self) -> usize {
        match self {
            Encoding::U8 => 1,
            Encoding::U16 | Encoding::I16 => 2,
            Encoding::U32 | Encoding::I32 => 4,
        }
    }

    /// Lê o valor bruto. `bytes` precisa ter pelo menos [`width`](Self::width) bytes.
    pub fn read(self, bytes: &[u8], order: ByteOrder) -> i64 {
        match (self, order) {
            (Encoding::U8, _) => i64::from(bytes[0]),
            (Encoding::U16, ByteOrder::Little) => i64::from(u16::from_le_bytes(array(bytes))),
            (Encoding::U16, ByteOrder::Big) => i64::from(u16::from_be_bytes(array(bytes))),
            (Encoding::I16, ByteOrder::Little) => i64::from(i16::from_le_bytes(array(bytes))),
            (Encoding::I16, ByteOrder::Big) => i64::from(i16::from_be_bytes(array(bytes))),
            (Encoding::U32, ByteOrder::Little) => i64::from(u32::from_le_bytes(array(bytes))),
            (Encoding::U32, ByteOrder::Big) => i64::from(u32::from_be_bytes(array(bytes))),
            (Encoding::I32, ByteOrder::Little) => i64::from(i32::from_le_bytes(array(bytes))),
            (Encoding::I32, ByteOrder::Big) => i64::from(i32::from_be_bytes(array(bytes))),
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

/// Conversão aplicada ao valor bruto.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scale {
    #[default]
    Raw,
    /// `raw / divisor`, arredondado para `decimals` casas
    Div { divisor: f64, decimals: u32 },
    /// `raw + add` (índices base 0 → base 1)
    Offset { add: i64 },
    /// Texto `0x...` com `digits` dígitos
    Hex { digits: usize },
}

impl Scale {
    pub fn div(divisor: f64, decimals: u32) -> Self {
        Scale::Div { divisor, decimals }
    }

    pub fn hex() -> Self {
        Scale::Hex { digits: 8 }
    }
}

/// Tipo de entidade exposta ao consumidor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[default]
    Sensor,
    BinarySensor,
}

/// Definição de um campo dentro do frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Chave do campo no mapa decodificado
    pub name: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub unit: Option<String>,
    /// Offset relativo ao `base_offset` do layout
    pub offset: usize,
    pub encoding: Encoding,
    /// Sobrescreve a ordem de bytes do layout
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
    #[serde(default)]
    pub scale: Scale,
    #[serde(default)]
    pub entity: EntityKind,
    #[serde(default)]
    pub icon: Option<String>,
}

impl FieldDef {
    pub fn new(name: &str, offset: usize, encoding: Encoding) -> Self {
        Self {
            name: name.into(),
            label: String::new(),
            unit: None,
            offset,
            encoding,
            byte_order: None,
            scale: Scale::Raw,
            entity: EntityKind::Sensor,
            icon: None,
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.into();
        self
    }

    pub fn unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn scale(mut self, scale: Scale) -> Self {
        self.scale = scale;
        self
    }

    pub fn binary(mut self) -> Self {
        self.entity = EntityKind::BinarySensor;
        self
    }

    pub fn icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Rótulo para exibição (cai para `name` se vazio).
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() { &self.name } else { &self.label }
    }
}

/// Layout de um tipo de frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    /// Offset absoluto ao qual os offsets dos campos são relativos
    pub base_offset: usize,
    pub byte_order: ByteOrder,
    pub fields: Vec<FieldDef>,
}

/// Campo numérico de identificação, com offset absoluto no frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdField {
    pub offset: usize,
    pub encoding: Encoding,
    #[serde(default)]
    pub byte_order: ByteOrder,
}

impl IdField {
    /// Lê o id se o campo couber no frame.
    pub fn read(&self, bytes: &[u8]) -> Option<u32> {
        let end = self.offset.checked_add(self.encoding.width())?;
        if end > bytes.len() {
            return None;
        }
        let raw = self.encoding.read(&bytes[self.offset..end], self.byte_order);
        u32::try_from(raw).ok()
    }
}

/// Registro completo: layouts por tipo + campos de id usados pela correlação.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    /// Endereço auto-reportado nos frames de identidade
    pub identity_id: IdField,
    /// Id alvo nos comandos do mestre
    pub command_target: IdField,
    #[serde(default)]
    pub telemetry: FrameLayout,
    #[serde(default)]
    pub identity: FrameLayout,
    #[serde(default)]
    pub command: FrameLayout,
}

impl Default for Registry {
    fn default() -> Self {
        Self::jk_pb2a16s30p()
    }
}

impl Registry {
    pub fn layout(&self, kind: FrameKind) -> &FrameLayout {
        match kind {
            FrameKind::Telemetry => &self.telemetry,
            FrameKind::Identity => &self.identity,
            FrameKind::Command => &self.command,
        }
    }

    /// Carrega um registro de arquivo TOML.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let registry = Self::from_toml_str(&content)?;
        info!("Registro carregado de {}", path.display());
        Ok(registry)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RegistryError> {
        let registry: Registry = toml::from_str(content)?;
        registry.check_unique_names()?;
        registry.check_scales()?;
        Ok(registry)
    }

    fn check_scales(&self) -> Result<(), RegistryError> {
        for kind in FrameKind::ALL {
            for field in &self.layout(kind).fields {
                if let Scale::Hex { digits } = field.scale {
                    if digits > MAX_HEX_DIGITS {
                        return Err(RegistryError::HexTooWide {
                            kind,
                            name: field.name.clone(),
                            digits,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn check_unique_names(&self) -> Result<(), RegistryError> {
        for kind in FrameKind::ALL {
            let mut seen = HashSet::new();
            for field in &self.layout(kind).fields {
                if !seen.insert(field.name.as_str()) {
                    return Err(RegistryError::DuplicateField {
                        kind,
                        name: field.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Registro embutido do JK PB2A16S30P.
    ///
    /// O endereço do dispositivo fica no offset absoluto 276 (u32 LE). Esse
    /// valor variou entre revisões de firmware e deve ser confirmado no hardware.
    pub fn jk_pb2a16s30p() -> Self {
        Self {
            identity_id: IdField {
                offset: 276,
                encoding: Encoding::U32,
                byte_order: ByteOrder::Little,
            },
            command_target: IdField {
                offset: 0,
                encoding: Encoding::U8,
                byte_order: ByteOrder::Big,
            },
            telemetry: FrameLayout {
                base_offset: 6,
                byte_order: ByteOrder::Little,
                fields: realtime_fields(),
            },
            identity: FrameLayout {
                base_offset: 6,
                byte_order: ByteOrder::Little,
                fields: settings_fields(),
            },
            command: FrameLayout {
                base_offset: 0,
                byte_order: ByteOrder::Big,
                fields: command_fields(),
            },
        }
    }
}

// ──────────────────────────────────────────────
// Tabelas do PB2A16S30P
// ──────────────────────────────────────────────

fn volts(name: &str, label: &str, offset: usize, encoding: Encoding) -> FieldDef {
    FieldDef::new(name, offset, encoding)
        .label(label)
        .unit("V")
        .scale(Scale::div(1000.0, 3))
        .icon("mdi:sine-wave")
}

fn amps(name: &str, label: &str, offset: usize, encoding: Encoding) -> FieldDef {
    FieldDef::new(name, offset, encoding)
        .label(label)
        .unit("A")
        .scale(Scale::div(1000.0, 3))
        .icon("mdi:current-dc")
}

fn celsius(name: &str, label: &str, offset: usize, encoding: Encoding) -> FieldDef {
    FieldDef::new(name, offset, encoding)
        .label(label)
        .unit("°C")
        .scale(Scale::div(10.0, 1))
        .icon("mdi:temperature-celsius")
}

fn seconds(name: &str, label: &str, offset: usize, encoding: Encoding) -> FieldDef {
    FieldDef::new(name, offset, encoding)
        .label(label)
        .unit("S")
        .icon("mdi:counter")
}

fn ampere_hours(name: &str, label: &str, offset: usize, encoding: Encoding) -> FieldDef {
    FieldDef::new(name, offset, encoding)
        .label(label)
        .unit("Ah")
        .scale(Scale::div(1000.0, 3))
        .icon("mdi:battery")
}

fn command_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new("target_slave_id", 0, Encoding::U8)
            .label("Id alvo")
            .icon("mdi:target-variant"),
        FieldDef::new("register", 2, Encoding::U16)
            .label("Registrador")
            .unit("Hex")
            .scale(Scale::Hex { digits: 4 })
            .icon("mdi:memory"),
        FieldDef::new("value_hex", 7, Encoding::U16)
            .label("Valor")
            .unit("Hex")
            .scale(Scale::Hex { digits: 4 })
            .icon("mdi:numeric"),
        FieldDef::new("value_int", 7, Encoding::U16)
            .label("Valor (inteiro)")
            .icon("mdi:numeric"),
    ]
}

fn settings_fields() -> Vec<FieldDef> {
    use Encoding::{I32, U8, U32};
    vec![
        volts("sleep_voltage", "Tensão de hibernação", 0, U32).icon("mdi:sleep"),
        volts("cell_uvp", "Subtensão da célula", 4, U32),
        volts("cell_uvp_recovery", "Recuperação de subtensão", 8, U32),
        volts("cell_ovp", "Sobretensão da célula", 12, U32),
        volts("cell_ovp_recovery", "Recuperação de sobretensão", 16, U32),
        volts("balance_trigger_diff", "Diferença para balancear", 20, U32),
        volts("soc_100_voltage", "Tensão SOC 100%", 24, U32),
        volts("soc_0_voltage", "Tensão SOC 0%", 28, U32),
        volts("rec_charge_voltage", "Tensão de carga recomendada", 32, U32),
        volts("float_charge_voltage", "Tensão de flutuação", 36, U32),
        volts("auto_shutdown_voltage", "Tensão de desligamento", 40, U32),
        amps("cont_charge_current", "Corrente de carga contínua", 44, U32),
        seconds("charge_ocp_delay", "Atraso OCP de carga", 48, U32),
        seconds("charge_ocp_release", "Liberação OCP de carga", 52, U32),
        amps("cont_discharge_current", "Corrente de descarga contínua", 56, U32),
        seconds("discharge_ocp_delay", "Atraso OCP de descarga", 60, U32),
        seconds("discharge_ocp_release", "Liberação OCP de descarga", 64, U32),
        seconds("sc_release", "Liberação de curto", 68, U32),
        FieldDef::new("max_balance_current", 72, U32)
            .label("Corrente máx. de balanceamento")
            .unit("mA")
            .icon("mdi:current-dc"),
        celsius("charge_otp", "Sobretemperatura de carga", 76, I32),
        celsius("charge_otp_recovery", "Recuperação OTP de carga", 80, I32),
        celsius("discharge_otp", "Sobretemperatura de descarga", 84, I32),
        celsius("discharge_otp_recovery", "Recuperação OTP de descarga", 88, I32),
        celsius("charge_utp", "Subtemperatura de carga", 92, I32),
        celsius("charge_utp_recovery", "Recuperação UTP de carga", 96, I32),
        celsius("mos_otp", "Sobretemperatura do MOS", 100, I32),
        celsius("mos_otp_recovery", "Recuperação OTP do MOS", 104, I32),
        FieldDef::new("cell_count", 108, U32)
            .label("Número de células")
            .icon("mdi:counter"),
        FieldDef::new("charge_switch", 112, U32)
            .label("Chave de carga")
            .unit("Bit")
            .binary()
            .icon("mdi:battery-charging"),
        FieldDef::new("discharge_switch", 116, U32)
            .label("Chave de descarga")
            .unit("Bit")
            .binary()
            .icon("mdi:battery-arrow-down"),
        FieldDef::new("balance_switch", 120, U32)
            .label("Chave de balanceamento")
            .unit("Bit")
            .binary()
            .icon("mdi:scale-balance"),
        FieldDef::new("sc_delay", 128, U32)
            .label("Atraso de curto")
            .unit("us")
            .icon("mdi:counter"),
        volts("balance_start_voltage", "Tensão inicial de balanceamento", 132, U32),
        FieldDef::new("device_address", 264, U32)
            .label("Endereço do dispositivo")
            .unit("Hex")
            .scale(Scale::hex())
            .icon("mdi:identifier"),
        FieldDef::new("smart_sleep_time", 280, U8)
            .label("Hibernação inteligente")
            .unit("H")
            .icon("mdi:sleep"),
    ]
}

fn realtime_fields() -> Vec<FieldDef> {
    use Encoding::{I16, I32, U8, U16, U32};
    let mut fields: Vec<FieldDef> = (0..16)
        .map(|i| {
            volts(
                &format!("cell_{:02}_voltage", i + 1),
                &format!("Célula {:02}", i + 1),
                i * 2,
                U16,
            )
        })
        .collect();

    fields.extend([
        volts("avg_voltage", "Tensão média", 68, U16),
        volts("max_diff_voltage", "Diferença máxima", 70, U16),
        FieldDef::new("max_cell_index", 72, U8)
            .label("Célula máxima")
            .scale(Scale::Offset { add: 1 })
            .icon("mdi:format-list-numbered"),
        FieldDef::new("min_cell_index", 73, U8)
            .label("Célula mínima")
            .scale(Scale::Offset { add: 1 })
            .icon("mdi:format-list-numbered"),
        celsius("power_board_temp", "Temperatura da placa", 138, I16),
        volts("total_voltage", "Tensão total", 144, U32),
        FieldDef::new("power_watts", 148, U32)
            .label("Potência")
            .unit("W")
            .scale(Scale::div(1000.0, 3))
            .icon("mdi:lightning-bolt"),
        amps("current", "Corrente", 152, I32),
        celsius("temp_sensor_1", "Temperatura 1", 156, I16),
        celsius("temp_sensor_2", "Temperatura 2", 158, I16),
        FieldDef::new("balance_current", 164, I16)
            .label("Corrente de balanceamento")
            .unit("mA")
            .icon("mdi:current-dc"),
        FieldDef::new("balance_action", 166, U8)
            .label("Balanceamento (1 carga, 2 descarga)")
            .unit("Enum")
            .icon("mdi:scale-balance"),
        FieldDef::new("soc_percent", 167, U8)
            .label("Estado de carga")
            .unit("%")
            .icon("mdi:battery"),
        ampere_hours("remaining_capacity_ah", "Capacidade restante", 168, I32),
        ampere_hours("actual_capacity_ah", "Capacidade real", 172, U32),
        FieldDef::new("cycle_count", 176, U32)
            .label("Ciclos")
            .unit("N")
            .icon("mdi:battery"),
        ampere_hours("total_cycle_capacity", "Capacidade total ciclada", 180, U32),
        seconds("runtime_seconds", "Tempo de operação", 188, U32),
        FieldDef::new("charge_status_hex", 192, U16)
            .label("Estado de carga (hex)")
            .unit("Hex")
            .scale(Scale::hex())
            .binary()
            .icon("mdi:switch"),
        seconds("discharge_ocp_release_time", "Liberação OCP de descarga", 196, U16),
        seconds("discharge_sc_release_time", "Liberação de curto na descarga", 198, U16),
        seconds("charge_ocp_release_time", "Liberação OCP de carga", 200, U16),
        seconds("charge_sc_release_time", "Liberação de curto na carga", 202, U16),
        seconds("cell_uvp_release_time", "Liberação de subtensão", 204, U16),
        seconds("cell_ovp_release_time", "Liberação de sobretensão", 206, U16),
        seconds("emergency_switch_time", "Tempo da chave de emergência", 212, U16),
        celsius("temp_sensor_3", "Temperatura 3", 248, I16),
        celsius("temp_sensor_4", "Temperatura 4", 250, I16),
        celsius("temp_sensor_5", "Temperatura 5", 252, I16),
        seconds("sleep_time_seconds", "Tempo para hibernar", 264, U32).icon("mdi:sleep"),
    ]);
    fields
}
