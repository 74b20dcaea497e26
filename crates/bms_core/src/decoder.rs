//! Decodificação de campos a partir dos bytes de um frame.
//!
//! Função pura: nada aqui conhece enquadramento ou correlação. Um campo ruim
//! nunca aborta o frame: campos fora do tamanho real são pulados e falhas de
//! escala caem para o valor bruto.

use crate::frame::FrameKind;
use crate::registry::{FieldDef, FrameLayout, MAX_HEX_DIGITS, Registry, Scale};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Mapa `nome do campo → valor` de um frame decodificado.
pub type DecodedFields = BTreeMap<String, Value>;

/// Valor decodificado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

/// Falha ao aplicar uma [`Scale`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScaleError {
    #[error("Divisor inválido")]
    InvalidDivisor,

    #[error("Resultado não finito")]
    NonFinite,

    #[error("Overflow ao somar {add} a {raw}")]
    Overflow { raw: i64, add: i64 },

    #[error("Valor negativo não tem representação hex: {0}")]
    NegativeHex(i64),
}

impl Scale {
    /// Converte o valor bruto.
    pub fn apply(&self, raw: i64) -> Result<Value, ScaleError> {
        match *self {
            Scale::Raw => Ok(Value::Int(raw)),
            Scale::Div { divisor, decimals } => {
                if divisor == 0.0 || !divisor.is_finite() {
                    return Err(ScaleError::InvalidDivisor);
                }
                let factor = 10f64.powi(decimals.min(15) as i32);
                let value = (raw as f64 / divisor * factor).round() / factor;
                if value.is_finite() {
                    Ok(Value::Float(value))
                } else {
                    Err(ScaleError::NonFinite)
                }
            }
            Scale::Offset { add } => raw
                .checked_add(add)
                .map(Value::Int)
                .ok_or(ScaleError::Overflow { raw, add }),
            Scale::Hex { digits } => {
                if raw < 0 {
                    return Err(ScaleError::NegativeHex(raw));
                }
                let digits = digits.min(MAX_HEX_DIGITS);
                Ok(Value::Text(format!("0x{raw:0digits$X}")))
            }
        }
    }
}

/// Resultado da decodificação de um campo isolado.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOutcome {
    Decoded(Value),
    /// O campo não cabe no frame
    OutOfRange,
    /// A escala falhou; `raw` é o valor sem conversão
    ScaleFailed { raw: i64, error: ScaleError },
}

/// Decodifica um campo de `bytes` segundo `layout`.
pub fn decode_field(field: &FieldDef, bytes: &[u8], layout: &FrameLayout) -> FieldOutcome {
    let Some(start) = layout.base_offset.checked_add(field.offset) else {
        return FieldOutcome::OutOfRange;
    };
    let end = match start.checked_add(field.encoding.width()) {
        Some(end) if end <= bytes.len() => end,
        _ => return FieldOutcome::OutOfRange,
    };

    let order = field.byte_order.unwrap_or(layout.byte_order);
    let raw = field.encoding.read(&bytes[start..end], order);
    match field.scale.apply(raw) {
        Ok(value) => FieldOutcome::Decoded(value),
        Err(error) => FieldOutcome::ScaleFailed { raw, error },
    }
}

/// Decodifica todos os campos registrados para `kind`.
pub fn decode(bytes: &[u8], kind: FrameKind, registry: &Registry) -> DecodedFields {
    let layout = registry.layout(kind);
    let mut fields = DecodedFields::new();

    for field in &layout.fields {
        match decode_field(field, bytes, layout) {
            FieldOutcome::Decoded(value) => {
                fields.insert(field.name.clone(), value);
            }
            FieldOutcome::OutOfRange => {}
            FieldOutcome::ScaleFailed { raw, error } => {
                debug!("{kind}/{}: {error}, usando valor bruto {raw}", field.name);
                fields.insert(field.name.clone(), Value::Int(raw));
            }
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::test_frames;
    use crate::registry::{ByteOrder, Encoding};

    fn layout(fields: Vec<FieldDef>) -> FrameLayout {
        FrameLayout {
            base_offset: 6,
            byte_order: ByteOrder::Little,
            fields,
        }
    }

    fn registry_with_telemetry(fields: Vec<FieldDef>) -> Registry {
        Registry {
            telemetry: layout(fields),
            ..Registry::jk_pb2a16s30p()
        }
    }

    #[test]
    fn scales_convert_raw_values() {
        assert_eq!(Scale::Raw.apply(42), Ok(Value::Int(42)));
        assert_eq!(Scale::div(1000.0, 3).apply(3312), Ok(Value::Float(3.312)));
        assert_eq!(Scale::div(10.0, 1).apply(-125), Ok(Value::Float(-12.5)));
        assert_eq!(Scale::Offset { add: 1 }.apply(4), Ok(Value::Int(5)));
        assert_eq!(Scale::hex().apply(0x1A), Ok(Value::Text("0x0000001A".into())));
        assert_eq!(Scale::Hex { digits: 4 }.apply(0x1620), Ok(Value::Text("0x1620".into())));
        assert_eq!(
            Scale::Hex { digits: usize::MAX }.apply(0xAB),
            Ok(Value::Text(format!("0x{:016X}", 0xAB)))
        );
    }

    #[test]
    fn scale_failures_are_reported() {
        assert_eq!(Scale::div(0.0, 2).apply(1), Err(ScaleError::InvalidDivisor));
        assert!(matches!(
            Scale::Offset { add: i64::MAX }.apply(1),
            Err(ScaleError::Overflow { .. })
        ));
        assert_eq!(Scale::hex().apply(-1), Err(ScaleError::NegativeHex(-1)));
    }

    #[test]
    fn field_outside_frame_is_skipped() {
        let registry = registry_with_telemetry(vec![
            FieldDef::new("present", 0, Encoding::U16),
            FieldDef::new("virtual", 9000, Encoding::U8),
            FieldDef::new("straddles_end", 4, Encoding::U32),
        ]);
        let bytes = [0u8, 0, 0, 0, 0, 0, 0x10, 0x00, 0, 0];
        let fields = decode(&bytes, FrameKind::Telemetry, &registry);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["present"], Value::Int(16));
    }

    #[test]
    fn failing_scale_falls_back_to_raw_without_aborting() {
        let registry = registry_with_telemetry(vec![
            FieldDef::new("broken", 0, Encoding::U8).scale(Scale::div(0.0, 1)),
            FieldDef::new("ok", 1, Encoding::U8).scale(Scale::Offset { add: 1 }),
        ]);
        let mut bytes = vec![0u8; 8];
        bytes[6] = 9;
        bytes[7] = 2;
        let fields = decode(&bytes, FrameKind::Telemetry, &registry);
        assert_eq!(fields["broken"], Value::Int(9));
        assert_eq!(fields["ok"], Value::Int(3));
    }

    #[test]
    fn field_byte_order_overrides_layout() {
        let field = FieldDef::new("be", 0, Encoding::U16);
        let mut big = field.clone();
        big.byte_order = Some(ByteOrder::Big);
        let l = layout(vec![]);
        let bytes = [0, 0, 0, 0, 0, 0, 0x12, 0x34];
        assert_eq!(decode_field(&field, &bytes, &l), FieldOutcome::Decoded(Value::Int(0x3412)));
        assert_eq!(decode_field(&big, &bytes, &l), FieldOutcome::Decoded(Value::Int(0x1234)));
    }

    #[test]
    fn synthetic_realtime_frame_recovers_values() {
        let registry = Registry::jk_pb2a16s30p();
        let mut frame = test_frames::telemetry(0x00);
        let base = 6;
        frame[base..base + 2].copy_from_slice(&3312u16.to_le_bytes());
        frame[base + 72] = 4;
        frame[base + 138..base + 140].copy_from_slice(&(-125i16).to_le_bytes());
        frame[base + 144..base + 148].copy_from_slice(&53_104u32.to_le_bytes());
        frame[base + 152..base + 156].copy_from_slice(&(-12_345i32).to_le_bytes());
        frame[base + 167] = 87;
        frame[base + 192..base + 194].copy_from_slice(&0x0101u16.to_le_bytes());

        let fields = decode(&frame, FrameKind::Telemetry, &registry);
        assert_eq!(fields["cell_01_voltage"], Value::Float(3.312));
        assert_eq!(fields["max_cell_index"], Value::Int(5));
        assert_eq!(fields["power_board_temp"], Value::Float(-12.5));
        assert_eq!(fields["total_voltage"], Value::Float(53.104));
        assert_eq!(fields["current"], Value::Float(-12.345));
        assert_eq!(fields["soc_percent"], Value::Int(87));
        assert_eq!(fields["charge_status_hex"], Value::Text("0x00000101".into()));
        assert_eq!(fields.len(), registry.telemetry.fields.len());
    }

    #[test]
    fn synthetic_settings_frame_recovers_values() {
        let registry = Registry::jk_pb2a16s30p();
        let mut frame = test_frames::identity(3);
        let base = 6;
        frame[base + 4..base + 8].copy_from_slice(&2_650u32.to_le_bytes());
        frame[base + 76..base + 80].copy_from_slice(&650i32.to_le_bytes());
        frame[base + 108..base + 112].copy_from_slice(&16u32.to_le_bytes());
        frame[base + 264..base + 268].copy_from_slice(&3u32.to_le_bytes());

        let fields = decode(&frame, FrameKind::Identity, &registry);
        assert_eq!(fields["cell_uvp"], Value::Float(2.65));
        assert_eq!(fields["charge_otp"], Value::Float(65.0));
        assert_eq!(fields["cell_count"], Value::Int(16));
        assert_eq!(fields["device_address"], Value::Text("0x00000003".into()));
    }

    #[test]
    fn command_frame_is_big_endian() {
        let registry = Registry::jk_pb2a16s30p();
        let frame = test_frames::command(3);
        let fields = decode(&frame, FrameKind::Command, &registry);
        assert_eq!(fields["target_slave_id"], Value::Int(3));
        assert_eq!(fields["register"], Value::Text("0x1620".into()));
        assert_eq!(fields["value_hex"], Value::Text("0x0005".into()));
        assert_eq!(fields["value_int"], Value::Int(5));
    }
}
