use std::sync::Arc;

/// Shape metadata sufficient to describe an image-like frame: width, height,
/// channel count and per-element byte size, plus a transposed tag the loader
/// facade's normalising transforms act on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketShape {
    pub width: u32,
    pub height: u32,
    pub channels: u16,
    pub element_size: u16,
    pub transposed: bool,
}

impl PacketShape {
    pub fn new(width: u32, height: u32, channels: u16, element_size: u16) -> Self {
        Self { width, height, channels, element_size, transposed: false }
    }

    /// Number of bytes one fully-packed frame of this shape occupies.
    pub fn byte_len(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.channels as usize
            * self.element_size as usize
    }
}

/// An opaque, immutable, indexed binary artefact: a video frame, a still
/// image, a ground-truth mask, or a result headed for archival.
///
/// `Packet` is a cheaply-cloneable handle over a reference-counted byte
/// buffer. The precacher and writer move packets between threads by cloning
/// this handle, never by sharing a raw pointer into their internal buffers.
#[derive(Clone, Debug, Default)]
pub struct Packet {
    bytes: Arc<[u8]>,
    shape: PacketShape,
}

impl Packet {
    /// Builds a packet from an owned byte buffer and its shape metadata.
    pub fn new(bytes: impl Into<Arc<[u8]>>, shape: PacketShape) -> Self {
        Self { bytes: bytes.into(), shape }
    }

    /// The end-of-stream / transient-absence sentinel: zero length, no shape.
    pub fn empty() -> Self {
        Self { bytes: Arc::from(&[][..]), shape: PacketShape::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn shape(&self) -> PacketShape {
        self.shape
    }

    pub(crate) fn from_arc(bytes: Arc<[u8]>, shape: PacketShape) -> Self {
        Self { bytes, shape }
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.bytes.as_ref() == other.bytes.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_packet_has_zero_length() {
        let p = Packet::empty();
        assert!(p.is_empty());
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn packets_compare_by_bytes_and_shape() {
        let shape = PacketShape::new(2, 2, 1, 1);
        let a = Packet::new(vec![1, 2, 3, 4], shape);
        let b = Packet::new(vec![1, 2, 3, 4], shape);
        let c = Packet::new(vec![1, 2, 3, 5], shape);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn shape_byte_len_accounts_for_all_dims() {
        let shape = PacketShape::new(4, 3, 3, 2);
        assert_eq!(shape.byte_len(), 4 * 3 * 3 * 2);
    }
}
