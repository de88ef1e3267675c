/// Errors surfaced by [`crate::precacher::Precacher`].
///
/// These are misuse/lifecycle errors, not data errors: a loader callback that
/// runs out of data signals that by returning an empty [`crate::Packet`], not
/// by producing one of these.
#[derive(Debug, thiserror::Error)]
pub enum PrecacherError {
    #[error("precacher already started")]
    AlreadyStarted,
    #[error("precacher worker thread panicked")]
    WorkerPanicked,
    #[error("buffer_bytes must be nonzero")]
    ZeroCapacity,
}

/// Errors surfaced by [`crate::writer::Writer`].
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("writer already started")]
    AlreadyStarted,
    #[error("writer worker thread panicked")]
    WorkerPanicked,
    #[error("n_workers must be nonzero")]
    ZeroWorkers,
}
