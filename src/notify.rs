//! Status change notification.
//!
//! Control clients that want to know "something changed" without polling
//! hand the engine a file descriptor (an eventfd works well); every status
//! transition writes one unit to it. Writes are best-effort and readers
//! are expected to coalesce: the signal carries no payload, it just says
//! "ask for status again".

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// A raw file descriptor, as the caller supplied it. The caller keeps
/// ownership; the engine never closes it.
pub type UpdateFd = i32;

/// The swappable notification fd slot.
///
/// The slot is shared between the player task (writer) and every handle
/// (setter), so replacement has to be safe against a concurrent write,
/// which is what the atomic swap gives us.
#[derive(Debug, Default)]
pub(crate) struct Notifier {
    /// The current fd, if any.
    fd: ArcSwapOption<UpdateFd>,
}

impl Notifier {
    /// A notifier with no fd attached.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Installs (or clears) the notification fd.
    pub fn set(&self, fd: Option<UpdateFd>) {
        self.fd.store(fd.map(Arc::new));
    }

    /// Signals one status change. Best-effort: failures are logged and
    /// otherwise ignored.
    pub fn signal(&self) {
        let Some(fd) = self.fd.load_full() else {
            return;
        };

        #[cfg(unix)]
        {
            // One eventfd-style unit. On a pipe this writes 8 bytes, which
            // readers drain and coalesce just the same.
            let unit: u64 = 1;

            // SAFETY: writing a stack buffer of the stated size to an fd the
            // caller handed us. The fd may be stale or closed, in which case
            // the write fails and we log it.
            let ret = unsafe {
                libc::write(
                    *fd,
                    std::ptr::from_ref(&unit).cast(),
                    std::mem::size_of::<u64>(),
                )
            };

            if ret < 0 {
                log::warn!(
                    "couldn't send status update: {}",
                    std::io::Error::last_os_error()
                );
            }
        }

        #[cfg(not(unix))]
        {
            let _ = fd;
        }
    }
}
