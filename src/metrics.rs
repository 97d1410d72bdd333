//! Metrics recorder.
//!
//! Log rows and token-counter updates are queued on a bounded channel and
//! flushed in small batches by a single writer task (100 events or 1 s).
//! The single writer serializes counter updates per token, which the
//! weighted-average formula requires. Recording is best-effort: a full
//! queue or a failed write drops the event with a local log line and never
//! blocks dispatch.

use once_cell::sync::Lazy;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::store::{self, LogRow, TokenStatSample};

const QUEUE_CAPACITY: usize = 1024;
const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum MetricsEvent {
    Log(LogRow),
    TokenStats { token_id: i64, sample: TokenStatSample },
}

static SENDER: Lazy<RwLock<Option<mpsc::Sender<MetricsEvent>>>> =
    Lazy::new(|| RwLock::new(None));

/// Spawn the writer task. Returns after wiring the queue; the task runs
/// until the shutdown signal flips, then drains.
pub fn init(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let (tx, mut rx) = mpsc::channel::<MetricsEvent>(QUEUE_CAPACITY);
    {
        let mut sender = SENDER.write().unwrap();
        *sender = Some(tx);
    }

    tokio::spawn(async move {
        let mut buffer: Vec<MetricsEvent> = Vec::with_capacity(BATCH_SIZE);
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            buffer.push(event);
                            if buffer.len() >= BATCH_SIZE {
                                flush(&mut buffer);
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    flush(&mut buffer);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        // Drain whatever is still queued before exiting.
        while let Ok(event) = rx.try_recv() {
            buffer.push(event);
        }
        flush(&mut buffer);
        crate::logger::info("metrics", "Metrics writer stopped");
    });
}

/// Queue a terminal log row.
pub fn record_log(row: LogRow) {
    enqueue(MetricsEvent::Log(row));
}

/// Queue a token-counter update.
pub fn record_token_stats(token_id: i64, sample: TokenStatSample) {
    enqueue(MetricsEvent::TokenStats { token_id, sample });
}

fn enqueue(event: MetricsEvent) {
    let guard = match SENDER.read() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    match guard.as_ref() {
        Some(sender) => {
            if sender.try_send(event).is_err() {
                crate::logger::warn("metrics", "Metrics queue full, dropping event");
            }
        }
        None => {
            // Recorder not running (startup, tests): write synchronously.
            drop(guard);
            flush(&mut vec![event]);
        }
    }
}

pub(crate) fn flush(buffer: &mut Vec<MetricsEvent>) {
    for event in buffer.drain(..) {
        let result = match &event {
            MetricsEvent::Log(row) => store::stats::append_log(row),
            MetricsEvent::TokenStats { token_id, sample } => {
                store::tokens::update_token_stats(*token_id, sample)
            }
        };
        if let Err(e) = result {
            crate::logger::warn("metrics", &format!("Dropped metrics write: {}", e));
        }
    }
}
