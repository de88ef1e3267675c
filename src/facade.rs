//! The loader facade: pairs an input [`Precacher`] with a ground-truth
//! [`Precacher`] and normalises each packet as it leaves the raw dataset
//! callback, before the precacher ever sees (and caches) its bytes.

use std::sync::Arc;

use crate::error::PrecacherError;
use crate::packet::Packet;
use crate::precacher::{Loader, Precacher, PrecacherBuilder};

/// The geometric size a dataset declares for a given index, used to decide
/// whether a loaded packet needs resampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketSize {
    pub width: u32,
    pub height: u32,
}

/// Per-index declared size lookup, supplied by the surrounding dataset code.
pub trait SizeLookup: Send + Sync + 'static {
    fn size_for(&self, index: u64) -> PacketSize;
}

impl<F> SizeLookup for F
where
    F: Fn(u64) -> PacketSize + Send + Sync + 'static,
{
    fn size_for(&self, index: u64) -> PacketSize {
        self(index)
    }
}

/// A capability object the surrounding dataset code supplies to normalise a
/// freshly loaded packet: swap axes for a transposed frame, pad channels to
/// an alignment boundary, resample to a declared size. The actual pixel
/// manipulation is intentionally not implemented here — per-task image
/// transforms are a dataset-backend concern, not the pipeline's.
pub trait FrameTransform: Send + Sync + 'static {
    fn normalise(&self, packet: Packet, declared: PacketSize) -> Packet;
}

/// A transform that returns its input unchanged; the default when the
/// dataset backend needs no per-frame normalisation.
pub struct IdentityTransform;

impl FrameTransform for IdentityTransform {
    fn normalise(&self, packet: Packet, _declared: PacketSize) -> Packet {
        packet
    }
}

/// Wraps a raw per-index loader so its output is normalised before a
/// [`Precacher`] ever caches it, so the cached bytes are already in their
/// final shape (§4.3: "these transforms belong to the loader callback").
struct NormalisingLoader<R, S, T> {
    raw: R,
    sizes: Arc<S>,
    transform: Arc<T>,
}

impl<R, S, T> Loader for NormalisingLoader<R, S, T>
where
    R: Fn(u64) -> Packet + Send + Sync + 'static,
    S: SizeLookup,
    T: FrameTransform,
{
    fn load(&self, index: u64) -> Packet {
        let packet = (self.raw)(index);
        if packet.is_empty() {
            return packet;
        }
        let declared = self.sizes.size_for(index);
        self.transform.normalise(packet, declared)
    }
}

/// Builds a [`LoaderFacade`] pairing two precachers behind one buffer-size
/// configuration, mirroring [`crate::precacher::PrecacherBuilder`].
pub struct LoaderFacadeBuilder {
    buffer_bytes: usize,
}

impl Default for LoaderFacadeBuilder {
    fn default() -> Self {
        Self { buffer_bytes: 64 * 1024 * 1024 }
    }
}

impl LoaderFacadeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes;
        self
    }

    /// Builds a facade with a shared `sizes` lookup and `transform`
    /// capability applied to both the input and ground-truth streams.
    pub fn build<R1, R2, S, T>(
        self,
        input_loader: R1,
        gt_loader: R2,
        sizes: S,
        transform: T,
    ) -> Result<LoaderFacade<R1, R2, S, T>, PrecacherError>
    where
        R1: Fn(u64) -> Packet + Send + Sync + 'static,
        R2: Fn(u64) -> Packet + Send + Sync + 'static,
        S: SizeLookup,
        T: FrameTransform,
    {
        let sizes = Arc::new(sizes);
        let transform = Arc::new(transform);
        let inputs = PrecacherBuilder::new().buffer_bytes(self.buffer_bytes).build(NormalisingLoader {
            raw: input_loader,
            sizes: Arc::clone(&sizes),
            transform: Arc::clone(&transform),
        })?;
        let ground_truth = PrecacherBuilder::new().buffer_bytes(self.buffer_bytes).build(NormalisingLoader {
            raw: gt_loader,
            sizes,
            transform,
        })?;
        Ok(LoaderFacade { inputs, ground_truth })
    }
}

/// Thin per-batch wrapper pairing two [`Precacher`]s (input, ground truth),
/// exposing `get_input`/`get_gt` to the algorithm. Neither precacher is
/// started on construction; call [`LoaderFacade::start`] to spawn both
/// worker threads together.
pub struct LoaderFacade<R1, R2, S, T>
where
    R1: Fn(u64) -> Packet + Send + Sync + 'static,
    R2: Fn(u64) -> Packet + Send + Sync + 'static,
    S: SizeLookup,
    T: FrameTransform,
{
    inputs: Precacher<NormalisingLoader<R1, S, T>>,
    ground_truth: Precacher<NormalisingLoader<R2, S, T>>,
}

impl<R1, R2, S, T> LoaderFacade<R1, R2, S, T>
where
    R1: Fn(u64) -> Packet + Send + Sync + 'static,
    R2: Fn(u64) -> Packet + Send + Sync + 'static,
    S: SizeLookup,
    T: FrameTransform,
{
    pub fn start(&mut self) -> Result<(), PrecacherError> {
        self.inputs.start()?;
        self.ground_truth.start()?;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.inputs.stop();
        self.ground_truth.stop();
    }

    pub fn get_input(&mut self, index: u64) -> Result<Packet, PrecacherError> {
        self.inputs.get_packet(index)
    }

    pub fn get_gt(&mut self, index: u64) -> Result<Packet, PrecacherError> {
        self.ground_truth.get_packet(index)
    }
}
