//! Dedicated per-processor worker threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use tracing::{debug, error, warn};

use crate::dispatch::FrameProcessor;
use crate::frame::FrameHandle;

/// Clears the busy flag when the callback is done, error, panic or not.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Spawn the worker loop for one processor. The loop ends when the
/// dispatcher drops the sending side of the mailbox.
pub(crate) fn spawn(
    name: String,
    rx: flume::Receiver<FrameHandle>,
    busy: Arc<AtomicBool>,
    mut processor: impl FrameProcessor,
) -> std::io::Result<JoinHandle<()>> {
    Builder::new()
        .name(format!("lumen-proc-{name}"))
        .spawn(move || {
            debug!(processor = %name, "worker started");
            while let Ok(handle) = rx.recv() {
                let guard = BusyGuard(busy.clone());
                let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(&handle)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(
                            processor = %name,
                            seq = handle.sequence(),
                            error = %err,
                            "processor callback failed"
                        );
                    }
                    Err(_) => {
                        error!(
                            processor = %name,
                            seq = handle.sequence(),
                            "processor callback panicked"
                        );
                    }
                }
                // The handle drops first so the buffer can recycle before
                // the busy flag opens this processor to the next frame.
                drop(handle);
                drop(guard);
            }
            debug!(processor = %name, "worker stopped");
        })
}
