//! Process-wide capture of panics as runtime error records.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::classifier::{ErrorClassifier, ErrorReport, Fault};

/// Install a panic hook that reports every panic to `classifier`.
///
/// The previously installed hook still runs. Reports are delivered by the
/// returned task, which ends once the runtime shuts down.
pub fn install_panic_hook(classifier: Arc<ErrorClassifier>) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Fault>();

    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let _ = tx.send(panic_fault(info));
        previous(info);
    }));

    tokio::spawn(async move {
        while let Some(fault) = rx.recv().await {
            classifier.report(ErrorReport::new(fault)).await;
        }
        debug!("Panic capture stopped");
    })
}

fn panic_fault(info: &PanicHookInfo<'_>) -> Fault {
    let payload = info.payload();
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    };

    let backtrace = Backtrace::capture();
    let backtrace = (backtrace.status() == BacktraceStatus::Captured).then(|| backtrace.to_string());

    Fault::Panic {
        message,
        location: info.location().map(|l| l.to_string()),
        backtrace,
    }
}
