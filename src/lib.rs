//! A dataset I/O substrate for computer-vision evaluation harnesses.
//!
//! Two reusable engines sit between a dataset backend and a synchronous
//! algorithm: a single-producer [`precacher::Precacher`] that keeps a
//! byte-bounded ring of pre-decoded packets ahead of the caller, and a
//! multi-worker [`writer::Writer`] that drains out-of-order output packets
//! to a user-supplied sink under a byte-bounded, backpressure-or-drop
//! queue. [`facade::LoaderFacade`] pairs two precachers (input, ground
//! truth) for the common evaluation-harness shape.

pub mod error;
pub mod facade;
pub mod packet;
pub mod precacher;
pub mod writer;

pub use error::{PrecacherError, WriterError};
pub use facade::{FrameTransform, IdentityTransform, LoaderFacade, LoaderFacadeBuilder, PacketSize, SizeLookup};
pub use packet::{Packet, PacketShape};
pub use precacher::{Loader, Precacher, PrecacherBuilder};
pub use writer::{PushOutcome, Sink, Writer, WriterBuilder};
