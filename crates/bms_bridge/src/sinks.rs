//! Sinks concretos do bridge.

use bms_core::config::SinkConfig;
use bms_core::decoder::DecodedFields;
use bms_core::frame::FrameKind;
use bms_core::protocol::{AttributedRecord, encode_record};
use bms_core::sink::Sink;
use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

/// Escreve cada registro no log.
#[derive(Debug, Default)]
pub struct LogSink;

impl Sink for LogSink {
    fn publish(&mut self, device_id: u32, kind: FrameKind, fields: &DecodedFields) {
        info!("BMS {device_id} [{kind}] {}", render(fields));
    }
}

fn render(fields: &DecodedFields) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Envia cada registro como datagrama UDP no formato de [`bms_core::protocol`].
#[derive(Debug)]
pub struct UdpSink {
    sock: UdpSocket,
    dest: String,
}

impl UdpSink {
    pub fn bind(dest: &str) -> std::io::Result<Self> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        info!("Sink UDP → {dest}");
        Ok(Self {
            sock,
            dest: dest.to_string(),
        })
    }
}

impl Sink for UdpSink {
    fn publish(&mut self, device_id: u32, kind: FrameKind, fields: &DecodedFields) {
        let unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let record = AttributedRecord {
            device_id,
            kind,
            unix_ms,
            fields: fields.clone(),
        };

        match encode_record(&record) {
            Ok(frame) => match self.sock.send_to(&frame, &self.dest) {
                Ok(sent) => debug!("→ {sent} bytes para {} (BMS {device_id} {kind})", self.dest),
                Err(e) => error!("Erro ao enviar UDP: {e}"),
            },
            Err(e) => error!("Erro ao serializar registro: {e}"),
        }
    }
}

/// Limita settings a uma publicação por dispositivo por intervalo e
/// opcionalmente esconde os comandos do mestre.
#[derive(Debug)]
pub struct Throttled<S> {
    inner: S,
    settings_interval: Duration,
    publish_commands: bool,
    last_settings: HashMap<u32, Instant>,
}

impl<S: Sink> Throttled<S> {
    pub fn new(inner: S, settings_interval: Duration, publish_commands: bool) -> Self {
        Self {
            inner,
            settings_interval,
            publish_commands,
            last_settings: HashMap::new(),
        }
    }

    pub fn from_config(inner: S, cfg: &SinkConfig) -> Self {
        // `max` leva NaN a zero; o que ainda falhar é grande demais
        let interval = Duration::try_from_secs_f64(cfg.settings_publish_interval_secs.max(0.0))
            .unwrap_or(Duration::MAX);
        Self::new(inner, interval, cfg.publish_commands)
    }

    fn publish_at(&mut self, device_id: u32, kind: FrameKind, fields: &DecodedFields, now: Instant) {
        match kind {
            FrameKind::Command if !self.publish_commands => return,
            FrameKind::Identity => {
                if let Some(last) = self.last_settings.get(&device_id) {
                    if now.saturating_duration_since(*last) < self.settings_interval {
                        return;
                    }
                }
                self.last_settings.insert(device_id, now);
            }
            _ => {}
        }
        self.inner.publish(device_id, kind, fields);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Sink> Sink for Throttled<S> {
    fn publish(&mut self, device_id: u32, kind: FrameKind, fields: &DecodedFields) {
        self.publish_at(device_id, kind, fields, Instant::now());
    }
}

/// Monta o sink descrito pela configuração.
pub fn build(cfg: &SinkConfig) -> std::io::Result<Throttled<Box<dyn Sink + Send>>> {
    let inner: Box<dyn Sink + Send> = match cfg.mode.as_str() {
        "udp" => Box::new(UdpSink::bind(&cfg.dest)?),
        _ => Box::new(LogSink),
    };
    Ok(Throttled::from_config(inner, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bms_core::decoder::Value;
    use bms_core::protocol::decode_record;
    use bms_core::sink::MemorySink;

    fn fields() -> DecodedFields {
        let mut fields = DecodedFields::new();
        fields.insert("cell_count".into(), Value::Int(16));
        fields
    }

    #[test]
    fn settings_are_throttled_per_device() {
        let mut sink = Throttled::new(MemorySink::new(), Duration::from_secs(60), false);
        let t0 = Instant::now();

        sink.publish_at(1, FrameKind::Identity, &fields(), t0);
        sink.publish_at(1, FrameKind::Identity, &fields(), t0 + Duration::from_secs(10));
        sink.publish_at(2, FrameKind::Identity, &fields(), t0 + Duration::from_secs(10));
        sink.publish_at(1, FrameKind::Identity, &fields(), t0 + Duration::from_secs(61));

        let devices: Vec<_> = sink.inner().records.iter().map(|r| r.device_id).collect();
        assert_eq!(devices, vec![1, 2, 1]);
    }

    #[test]
    fn realtime_is_never_throttled() {
        let mut sink = Throttled::new(MemorySink::new(), Duration::from_secs(60), false);
        let t0 = Instant::now();
        for _ in 0..3 {
            sink.publish_at(1, FrameKind::Telemetry, &fields(), t0);
        }
        assert_eq!(sink.inner().records.len(), 3);
    }

    #[test]
    fn commands_hidden_unless_enabled() {
        let t0 = Instant::now();
        let mut hidden = Throttled::new(MemorySink::new(), Duration::ZERO, false);
        hidden.publish_at(3, FrameKind::Command, &fields(), t0);
        assert!(hidden.inner().records.is_empty());

        let mut shown = Throttled::new(MemorySink::new(), Duration::ZERO, true);
        shown.publish_at(3, FrameKind::Command, &fields(), t0);
        assert_eq!(shown.inner().records.len(), 1);
    }

    #[test]
    fn udp_sink_sends_decodable_record() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let dest = receiver.local_addr().unwrap().to_string();

        let mut sink = UdpSink::bind(&dest).unwrap();
        sink.publish(4, FrameKind::Telemetry, &fields());

        let mut buf = [0u8; 2048];
        let (size, _) = receiver.recv_from(&mut buf).unwrap();
        let record = decode_record(&buf[..size]).unwrap();
        assert_eq!(record.device_id, 4);
        assert_eq!(record.kind, FrameKind::Telemetry);
        assert_eq!(record.fields, fields());
    }

    #[test]
    fn unbounded_interval_publishes_settings_once() {
        let mut cfg = SinkConfig::default();
        cfg.settings_publish_interval_secs = f64::INFINITY;
        let mut sink = Throttled::from_config(MemorySink::new(), &cfg);
        let t0 = Instant::now();

        sink.publish_at(1, FrameKind::Identity, &fields(), t0);
        sink.publish_at(1, FrameKind::Identity, &fields(), t0 + Duration::from_secs(3600));
        assert_eq!(sink.inner().records.len(), 1);
    }

    #[test]
    fn renders_fields_in_name_order() {
        let mut f = fields();
        f.insert("avg_voltage".into(), Value::Float(3.3));
        assert_eq!(render(&f), "avg_voltage=3.3 cell_count=16");
    }
}
