//! Scoped capture of log output produced while running an exporter.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::Level;

use crate::errors::ExportError;

/// In-memory sink for formatted log records.
#[derive(Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    /// Return the text written so far.
    pub fn contents(&self) -> String {
        match self.0.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl io::Write for CaptureBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Result of a captured call.
pub struct Captured<T> {
    pub result: Result<T, ExportError>,

    /// Log output produced during the call. Empty if output was not
    /// captured.
    pub output: String,
}

/// Run `f`, capturing the log records it emits unless `visible` is set.
///
/// While `f` runs, a subscriber which formats every record into an
/// in-memory buffer replaces the current subscriber for this thread. The
/// previous subscriber is restored when `f` returns or panics. Panics are
/// caught and reported as [`ExportError::Panicked`].
///
/// The process-wide panic hook is left untouched, so a panic message may
/// still be printed to stderr.
pub fn capture<T>(visible: bool, f: impl FnOnce() -> Result<T, ExportError>) -> Captured<T> {
    let run = move || match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(ExportError::Panicked(panic_message(payload.as_ref()))),
    };

    if visible {
        return Captured {
            result: run(),
            output: String::new(),
        };
    }

    let buffer = CaptureBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_max_level(Level::TRACE)
        .with_target(true)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, run);

    Captured {
        result,
        output: buffer.contents(),
    }
}

/// Extract the message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use tracing::{info, warn};

    use super::capture;
    use crate::errors::ExportError;

    #[test]
    fn test_capture_output() {
        let captured = capture(false, || {
            info!(target: "exporter", step = 1, "tracing model");
            Ok(42)
        });
        assert_eq!(captured.result.unwrap(), 42);
        assert!(captured.output.contains("tracing model"));
        assert!(captured.output.contains("step=1"));
    }

    #[test]
    fn test_capture_error() {
        let captured = capture::<()>(false, || {
            warn!("about to fail");
            Err(ExportError::Failed("boom".into()))
        });
        assert_eq!(captured.result.unwrap_err().to_string(), "boom");
        assert!(captured.output.contains("about to fail"));
    }

    #[test]
    fn test_capture_panic() {
        let captured = capture::<()>(false, || panic!("exporter crashed"));
        match captured.result {
            Err(ExportError::Panicked(msg)) => assert_eq!(msg, "exporter crashed"),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }

        let captured = capture::<()>(true, || panic!("{} crashed", "exporter"));
        assert!(matches!(captured.result, Err(ExportError::Panicked(msg)) if msg == "exporter crashed"));
        assert!(captured.output.is_empty());
    }

    #[test]
    fn test_visible_output_not_captured() {
        let captured = capture(true, || {
            info!("not captured");
            Ok(())
        });
        assert!(captured.result.is_ok());
        assert!(captured.output.is_empty());
    }
}
