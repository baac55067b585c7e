//! Engine tests.
//!
//! Everything here drives the engine the way an embedder would: through a
//! [`crate::Handle`] wired to mock collaborators (see [`support`]), on a
//! paused-time tokio runtime so the packet timer and the playback clock
//! are fully deterministic.

mod clock;
mod queue;
mod support;
