//! Pipeline produtor/consumidor de um canal.
//!
//! A thread leitora alimenta o [`FrameExtractor`] e empurra os frames numa
//! fila limitada. Uma única thread consumidora roda correlação, decoder e
//! sink em sequência, então o estado de correlação não precisa de lock.
//! Fila cheia descarta o frame mais novo: o link físico nunca para de drenar.

use crate::config::CorrelationConfig;
use crate::correlation::CorrelationEngine;
use crate::decoder::decode;
use crate::extractor::FrameExtractor;
use crate::frame::Frame;
use crate::registry::Registry;
use crate::sink::Sink;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Evento enviado da thread leitora para a consumidora.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(Frame),
    /// O link caiu: todo estado pendente deve ser descartado
    Reset,
}

/// Resultado de [`FrameQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Fila cheia, o frame mais novo foi descartado
    Dropped,
    /// O consumidor encerrou
    Disconnected,
}

/// Lado produtor da fila de frames.
#[derive(Debug, Clone)]
pub struct FrameQueue {
    tx: Sender<LinkEvent>,
    dropped: Arc<AtomicU64>,
}

/// Cria a fila limitada e retorna os dois lados.
pub fn frame_queue(depth: usize) -> (FrameQueue, Receiver<LinkEvent>) {
    let (tx, rx) = bounded(depth.max(1));
    let queue = FrameQueue {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (queue, rx)
}

impl FrameQueue {
    /// Enfileira sem bloquear.
    pub fn push(&self, frame: Frame) -> PushOutcome {
        match self.tx.try_send(LinkEvent::Frame(frame)) {
            Ok(()) => PushOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Fila cheia, {dropped} frame(s) descartado(s) até agora");
                }
                PushOutcome::Dropped
            }
            Err(TrySendError::Disconnected(_)) => PushOutcome::Disconnected,
        }
    }

    /// Sinaliza reconexão. Bloqueia até haver espaço, o marcador nunca é perdido.
    pub fn reset(&self) -> bool {
        self.tx.send(LinkEvent::Reset).is_ok()
    }

    /// Frames descartados por fila cheia.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Lê `reader` até EOF, recortando frames e enfileirando-os.
///
/// Retorna `Ok(())` no EOF e o erro de IO em qualquer outra falha, inclusive
/// timeout de leitura; em ambos os casos o chamador decide reconectar.
/// Se o consumidor encerrar, para na hora com [`ErrorKind::BrokenPipe`].
pub fn pump<R: Read>(
    reader: &mut R,
    extractor: &mut FrameExtractor,
    queue: &FrameQueue,
    buf_size: usize,
    raw_log: bool,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; buf_size.max(1)];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let chunk = &buf[..n];
        if raw_log {
            debug!("[RAW] {}", to_hex(chunk));
        }
        for frame in extractor.feed(chunk) {
            if queue.push(frame) == PushOutcome::Disconnected {
                return Err(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "consumidor de frames encerrado",
                ));
            }
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02X}");
        out
    })
}

/// Lado consumidor: correlação → decoder → sink.
pub struct Pipeline<S> {
    engine: CorrelationEngine,
    registry: Registry,
    sink: S,
    published: u64,
}

impl<S: Sink> Pipeline<S> {
    pub fn new(engine: CorrelationEngine, registry: Registry, sink: S) -> Self {
        Self {
            engine,
            registry,
            sink,
            published: 0,
        }
    }

    pub fn from_config(config: &CorrelationConfig, registry: Registry, sink: S) -> Self {
        let engine = CorrelationEngine::new(config.expiry(), registry.identity_id, registry.command_target);
        Self::new(engine, registry, sink)
    }

    pub fn handle(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame(frame) => {
                for attributed in self.engine.process(frame) {
                    let kind = attributed.kind();
                    let fields = decode(&attributed.frame.bytes, kind, &self.registry);
                    self.sink.publish(attributed.device_id, kind, &fields);
                    self.published += 1;
                }
            }
            LinkEvent::Reset => {
                debug!("Reset do link, descartando estado de correlação");
                self.engine.reset();
            }
        }
    }

    /// Consome eventos até todos os produtores serem encerrados.
    pub fn run(&mut self, rx: &Receiver<LinkEvent>) {
        for event in rx.iter() {
            self.handle(event);
        }
        let stats = self.engine.stats();
        info!(
            "Consumidor encerrado: {} registros publicados, {} telemetrias substituídas, {} expiradas, {} comandos expirados",
            self.published, stats.telemetry_replaced, stats.telemetry_stale, stats.commands_expired
        );
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

/// Inicia a thread consumidora. A thread devolve a pipeline ao terminar.
pub fn spawn_consumer<S>(mut pipeline: Pipeline<S>, rx: Receiver<LinkEvent>) -> std::io::Result<JoinHandle<Pipeline<S>>>
where
    S: Sink + Send + 'static,
{
    std::thread::Builder::new()
        .name("bms-consumer".into())
        .spawn(move || {
            pipeline.run(&rx);
            pipeline
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramingConfig;
    use crate::decoder::Value;
    use crate::extractor::test_frames;
    use crate::frame::FrameKind;
    use crate::sink::MemorySink;
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    fn pipeline() -> Pipeline<MemorySink> {
        let config = CorrelationConfig {
            expiry_secs: 0.4,
            queue_depth: 8,
        };
        Pipeline::from_config(&config, Registry::jk_pb2a16s30p(), MemorySink::new())
    }

    fn frame(kind: FrameKind, bytes: Vec<u8>, arrival: Instant) -> LinkEvent {
        LinkEvent::Frame(Frame::new(kind, bytes, arrival))
    }

    #[test]
    fn command_then_identity_publishes_decoded_records() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.handle(frame(FrameKind::Command, test_frames::command(3), t0));
        p.handle(frame(
            FrameKind::Identity,
            test_frames::identity(3),
            t0 + Duration::from_millis(200),
        ));

        let records = &p.sink().records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, FrameKind::Command);
        assert_eq!(records[0].device_id, 3);
        assert_eq!(records[0].fields["target_slave_id"], Value::Int(3));
        assert_eq!(records[1].kind, FrameKind::Identity);
        assert_eq!(records[1].device_id, 3);
        assert_eq!(p.published(), 2);
    }

    #[test]
    fn telemetry_falls_back_to_master_without_command() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.handle(frame(FrameKind::Telemetry, test_frames::telemetry(0), t0));
        p.handle(frame(
            FrameKind::Identity,
            test_frames::identity(7),
            t0 + Duration::from_millis(100),
        ));

        let telemetry: Vec<_> = p.sink().of_kind(FrameKind::Telemetry).collect();
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].device_id, 0);
        assert!(telemetry[0].fields.contains_key("cell_01_voltage"));
    }

    #[test]
    fn reset_event_drops_pending_state() {
        let mut p = pipeline();
        let t0 = Instant::now();
        p.handle(frame(FrameKind::Telemetry, test_frames::telemetry(0), t0));
        p.handle(LinkEvent::Reset);
        p.handle(frame(FrameKind::Identity, test_frames::identity(0), t0));

        assert_eq!(p.sink().records.len(), 1);
        assert_eq!(p.sink().records[0].kind, FrameKind::Identity);
    }

    #[test]
    fn full_queue_drops_newest_and_counts() {
        let (queue, rx) = frame_queue(2);
        let t0 = Instant::now();
        for i in 0..5u8 {
            queue.push(Frame::new(FrameKind::Command, test_frames::command(i), t0));
        }
        assert_eq!(queue.dropped(), 3);

        let kept: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                LinkEvent::Frame(f) => Some(f.bytes[0]),
                LinkEvent::Reset => None,
            })
            .collect();
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn pump_feeds_queue_until_eof() {
        let (queue, rx) = frame_queue(16);
        let mut extractor = FrameExtractor::new(FramingConfig::default());

        let mut stream = test_frames::command(2);
        stream.extend_from_slice(&test_frames::telemetry(0));
        stream.extend_from_slice(&test_frames::identity(2));
        stream.extend_from_slice(&test_frames::identity(9)[..50]);

        let mut reader = Cursor::new(stream);
        pump(&mut reader, &mut extractor, &queue, 7, true).unwrap();

        let kinds: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                LinkEvent::Frame(f) => Some(f.kind),
                LinkEvent::Reset => None,
            })
            .collect();
        assert_eq!(kinds, vec![FrameKind::Command, FrameKind::Telemetry, FrameKind::Identity]);
        assert_eq!(extractor.buffered(), 50);
    }

    /// Entrega um frame de comando a cada leitura, sem nunca chegar ao EOF.
    struct EndlessCommands {
        reads: usize,
    }

    impl Read for EndlessCommands {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads += 1;
            if self.reads > 1000 {
                return Ok(0);
            }
            let frame = test_frames::command(1);
            buf[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }
    }

    #[test]
    fn pump_stops_when_consumer_is_gone() {
        let (queue, rx) = frame_queue(4);
        drop(rx);
        let mut extractor = FrameExtractor::new(FramingConfig::default());
        let mut reader = EndlessCommands { reads: 0 };

        let err = pump(&mut reader, &mut extractor, &queue, 64, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert_eq!(reader.reads, 1);
        assert!(!queue.reset());
    }

    #[test]
    fn push_reports_each_outcome() {
        let (queue, rx) = frame_queue(1);
        let t0 = Instant::now();
        let cmd = || Frame::new(FrameKind::Command, test_frames::command(1), t0);

        assert_eq!(queue.push(cmd()), PushOutcome::Queued);
        assert_eq!(queue.push(cmd()), PushOutcome::Dropped);
        drop(rx);
        assert_eq!(queue.push(cmd()), PushOutcome::Disconnected);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn consumer_thread_drains_and_returns_pipeline() {
        let (queue, rx) = frame_queue(16);
        let handle = spawn_consumer(pipeline(), rx).unwrap();

        let t0 = Instant::now();
        queue.push(Frame::new(FrameKind::Telemetry, test_frames::telemetry(0), t0));
        queue.push(Frame::new(FrameKind::Identity, test_frames::identity(0), t0));
        assert!(queue.reset());
        drop(queue);

        let p = handle.join().unwrap();
        assert_eq!(p.published(), 2);
        assert!(!p.engine().has_pending_telemetry());
    }

    #[test]
    fn hex_is_uppercase() {
        assert_eq!(to_hex(&[0x55, 0xaa, 0x0b]), "55AA0B");
    }
}
