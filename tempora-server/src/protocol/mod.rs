//! Protocol adapters producing metric samples

pub mod graphite;
pub mod line;

use crossbeam_channel::{Sender, TrySendError};
use tempora_core::{Metric, Result, TemporaError};

/// Hand samples to an ingestion source
///
/// Sends without blocking while the source has room; once it is full the
/// remainder is sent from the blocking pool so the runtime is not stalled.
pub async fn forward(sink: &Sender<Metric>, metrics: Vec<Metric>) -> Result<()> {
    let mut pending = metrics.into_iter();
    while let Some(metric) = pending.next() {
        match sink.try_send(metric) {
            Ok(()) => {}
            Err(TrySendError::Full(metric)) => {
                let sink = sink.clone();
                let rest: Vec<Metric> = std::iter::once(metric).chain(pending).collect();
                return tokio::task::spawn_blocking(move || {
                    rest.into_iter().try_for_each(|m| sink.send(m).map_err(|_| closed()))
                })
                .await
                .map_err(|e| TemporaError::Internal(e.to_string()))?;
            }
            Err(TrySendError::Disconnected(_)) => return Err(closed()),
        }
    }
    Ok(())
}

fn closed() -> TemporaError {
    TemporaError::Internal("ingestion pipeline has stopped".into())
}
