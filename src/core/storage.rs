//! Prediction-head snapshots.
//!
//! Layout: 8-byte magic, `u32` version, then chunks. Every chunk is
//! `tag: [u8; 4]`, `len: u32`, `uncompressed_len: u32`, LZ4 block. A `HEAD`
//! chunk records the variant, radii and map sizes; the rest are raw `f32`
//! images. Unknown chunks are skipped on load.

use std::io::{self, Read, Write};

use crate::backend::{ComputeBackend, ImageId};
use crate::error::NetworkError;
use crate::layer::ProcessingLayer;
use crate::network::{Network, NetworkKind};

pub const MAGIC: &[u8; 8] = b"HEINET01";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

/// Write one LZ4 chunk, preceded by its uncompressed length.
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read the body of a chunk whose header was just consumed.
pub fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(u64::from(len));
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    decompress_lz4(&compressed, uncompressed_len)
}

pub fn f32_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn bytes_to_f32(bytes: &[u8]) -> io::Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(invalid("image chunk is not a whole number of f32"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn kind_tag(kind: NetworkKind) -> u32 {
    match kind {
        NetworkKind::Htsl => 0,
        NetworkKind::HeiNet => 1,
    }
}

impl<B, L> Network<B, L>
where
    B: ComputeBackend + ?Sized,
    L: ProcessingLayer<B>,
{
    fn head_words(&self) -> [u32; 9] {
        let b = &self.base;
        [
            kind_tag(self.kind),
            self.weights_from_e.radius() as u32,
            self.weights_from_i.radius() as u32,
            b.feed_forward.width as u32,
            b.feed_forward.height as u32,
            b.excitatory.width as u32,
            b.excitatory.height as u32,
            b.inhibitory.width as u32,
            b.inhibitory.height as u32,
        ]
    }

    /// Images persisted in a snapshot, by chunk tag.
    fn snapshot_images(&self) -> Vec<([u8; 4], ImageId)> {
        let mut images = vec![
            (*b"WEPV", self.weights_from_e.previous()),
            (*b"WIPV", self.weights_from_i.previous()),
            (*b"PRED", *self.prediction.current()),
            (*b"PRDP", *self.prediction.previous()),
        ];
        if let Some(spikes) = self.spikes.as_ref() {
            images.extend([
                (*b"SEC0", spikes.e.current()),
                (*b"SEP0", spikes.e.previous()),
                (*b"SEI0", spikes.e.previous_iteration()),
                (*b"SIC0", spikes.i.current()),
                (*b"SIP0", spikes.i.previous()),
                (*b"SII0", spikes.i.previous_iteration()),
            ]);
        }
        images
    }

    /// Persist the prediction head: previous weights, prediction maps and
    /// spike sums. Blocks on device readback.
    pub fn save_prediction_head<W: Write>(
        &self,
        backend: &mut B,
        w: &mut W,
    ) -> Result<(), NetworkError> {
        w.write_all(MAGIC)?;
        write_u32_le(w, VERSION_CURRENT)?;

        let mut head = Vec::with_capacity(9 * 4);
        for word in self.head_words() {
            write_u32_le(&mut head, word)?;
        }
        write_chunk_lz4(w, *b"HEAD", &head)?;

        let images = self.snapshot_images();
        for (tag, image) in &images {
            let values = backend.read_image(*image)?;
            write_chunk_lz4(w, *tag, &f32_to_bytes(&values))?;
        }
        tracing::debug!(chunks = images.len() + 1, "saved prediction head");
        Ok(())
    }

    pub fn save_prediction_head_bytes(&self, backend: &mut B) -> Result<Vec<u8>, NetworkError> {
        let mut buf = Vec::new();
        self.save_prediction_head(backend, &mut buf)?;
        Ok(buf)
    }

    /// Restore a snapshot taken from a network of the same variant and shape.
    ///
    /// Both halves of each weight pair end up holding the saved weights.
    pub fn load_prediction_head<R: Read>(
        &mut self,
        backend: &mut B,
        r: &mut R,
    ) -> Result<(), NetworkError> {
        if let Some(failed) = self.faulted {
            return Err(NetworkError::Faulted(failed));
        }

        let magic = read_exact::<8, _>(r)?;
        if &magic != MAGIC {
            return Err(invalid("bad prediction head magic").into());
        }
        let version = read_u32_le(r)?;
        if version != VERSION_CURRENT {
            return Err(invalid("unsupported prediction head version").into());
        }

        let mut head_seen = false;
        let mut chunks: Vec<([u8; 4], Vec<f32>)> = Vec::new();
        loop {
            let (tag, len) = match read_chunk_header(r) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            };
            let payload = read_chunk_payload(r, len)?;

            if &tag == b"HEAD" {
                let mut cursor = io::Cursor::new(payload);
                for expected in self.head_words() {
                    if read_u32_le(&mut cursor)? != expected {
                        return Err(invalid("snapshot is from a different network shape").into());
                    }
                }
                head_seen = true;
            } else {
                chunks.push((tag, bytes_to_f32(&payload)?));
            }
        }
        if !head_seen {
            return Err(invalid("snapshot has no HEAD chunk").into());
        }

        // Resolve and size-check every image before touching the device, so
        // a rejected snapshot leaves the network as it was.
        let mut staged = Vec::new();
        for (tag, image) in self.snapshot_images() {
            let values = chunks
                .iter()
                .find(|(t, _)| *t == tag)
                .map(|(_, v)| v)
                .ok_or_else(|| invalid("snapshot is missing an image chunk"))?;
            if values.len() != backend.image_dims(image)?.volume() {
                return Err(invalid("snapshot image has the wrong size").into());
            }
            staged.push((image, values));
        }
        for (image, values) in staged {
            backend.write_image(image, values)?;
        }
        self.weights_from_e.sync_current(backend)?;
        self.weights_from_i.sync_current(backend)?;

        tracing::info!(kind = ?self.kind, "loaded prediction head");
        Ok(())
    }

    pub fn load_prediction_head_bytes(
        &mut self,
        backend: &mut B,
        bytes: &[u8],
    ) -> Result<(), NetworkError> {
        let mut cursor = io::Cursor::new(bytes);
        self.load_prediction_head(backend, &mut cursor)
    }
}
