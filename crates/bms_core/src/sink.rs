//! Interface do consumidor final dos frames atribuídos e decodificados.

use crate::decoder::DecodedFields;
use crate::frame::FrameKind;

/// Recebe um registro por frame atribuído e decodificado.
///
/// Publicação, tópicos e throttling são responsabilidade da implementação.
pub trait Sink {
    fn publish(&mut self, device_id: u32, kind: FrameKind, fields: &DecodedFields);
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn publish(&mut self, device_id: u32, kind: FrameKind, fields: &DecodedFields) {
        (**self).publish(device_id, kind, fields);
    }
}

/// Registro guardado pelo [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedRecord {
    pub device_id: u32,
    pub kind: FrameKind,
    pub fields: DecodedFields,
}

/// Sink que acumula os registros em memória (testes e replay).
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<PublishedRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of_kind(&self, kind: FrameKind) -> impl Iterator<Item = &PublishedRecord> {
        self.records.iter().filter(move |r| r.kind == kind)
    }
}

impl Sink for MemorySink {
    fn publish(&mut self, device_id: u32, kind: FrameKind, fields: &DecodedFields) {
        self.records.push(PublishedRecord {
            device_id,
            kind,
            fields: fields.clone(),
        });
    }
}
