//! Buffered, background-flushed persistence of one record per `Fetch` call.
//! Never blocks the request path and never loses an error record to a full
//! buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use egress_core::responsechannel;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::store::{AuditStore, LogRow};

/// One audited fetch. `status` and `error_code` are mutually informative:
/// exactly one of them should be meaningful for a given record, though
/// neither is enforced to be absent at construction time.
#[derive(Debug, Clone)]
pub struct LogRecord {
	pub app: String,
	pub host: String,
	pub method: String,
	pub path: String,
	pub status: Option<u16>,
	pub error_code: Option<String>,
	pub duration: Duration,
	pub request_bytes: u64,
	pub response_bytes: u64,
	pub timestamp: Option<DateTime<Utc>>,
}

impl LogRecord {
	/// Strip everything from the first `?` onward, per the "path never
	/// contains a query string" invariant.
	pub fn strip_query(path: &str) -> String {
		match path.find('?') {
			Some(idx) => path[..idx].to_string(),
			None => path.to_string(),
		}
	}

	fn into_row(mut self) -> LogRow {
		self.path = Self::strip_query(&self.path);
		LogRow {
			app: self.app,
			host: self.host,
			method: self.method,
			path: self.path,
			status: self.status,
			error_code: self.error_code,
			duration_ms: self.duration.as_millis() as i64,
			request_bytes: self.request_bytes as i64,
			response_bytes: self.response_bytes as i64,
			created_at: self.timestamp.unwrap_or_else(Utc::now),
		}
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditStats {
	pub buffered: usize,
	pub dropped: u64,
}

struct Shared {
	buffer: Mutex<Vec<LogRecord>>,
	capacity: usize,
	dropped: AtomicU64,
	notify: Notify,
}

pub struct AuditLogger {
	shared: Arc<Shared>,
	flush_tx: responsechannel::AckSender<()>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
	/// Construct and start the background flusher in one step; `Stop` tears
	/// it down.
	pub fn start(store: Arc<dyn AuditStore>, capacity: usize, flush_interval: Duration) -> Self {
		let shared = Arc::new(Shared {
			buffer: Mutex::new(Vec::with_capacity(capacity.min(1024))),
			capacity,
			dropped: AtomicU64::new(0),
			notify: Notify::new(),
		});

		let (flush_tx, mut flush_rx) = responsechannel::new::<(), ()>(1);
		let task_shared = shared.clone();
		let task = tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(flush_interval) => {
						flush(&task_shared, &store).await;
					}
					_ = task_shared.notify.notified() => {
						flush(&task_shared, &store).await;
					}
					stop = flush_rx.recv() => {
						flush(&task_shared, &store).await;
						if let Some((_, ack)) = stop {
							let _ = ack.send(());
						}
						break;
					}
				}
			}
		});

		AuditLogger {
			shared,
			flush_tx,
			task: Mutex::new(Some(task)),
		}
	}

	/// Append a record, triggering an immediate flush for error/4xx+
	/// records. Never blocks: a full buffer simply drops the record and
	/// increments the drop counter.
	pub fn log(&self, record: LogRecord) {
		let urgent = record.error_code.is_some() || record.status.map(|s| s >= 400).unwrap_or(false);
		let mut buffer = self.shared.buffer.lock();
		if buffer.len() >= self.shared.capacity {
			if !urgent {
				self.shared.dropped.fetch_add(1, Ordering::Relaxed);
				return;
			}
		}
		buffer.push(record);
		drop(buffer);
		if urgent {
			self.shared.notify.notify_one();
		}
	}

	pub fn stats(&self) -> AuditStats {
		AuditStats {
			buffered: self.shared.buffer.lock().len(),
			dropped: self.shared.dropped.load(Ordering::Relaxed),
		}
	}

	/// Stop the background flusher after one final flush so no buffered
	/// record is lost at shutdown.
	pub async fn stop(&self) {
		let task = self.task.lock().take();
		if let Some(task) = task {
			let _ = self.flush_tx.send_and_wait(()).await;
			let _ = task.await;
		}
	}
}

async fn flush(shared: &Shared, store: &Arc<dyn AuditStore>) {
	let records = {
		let mut buffer = shared.buffer.lock();
		std::mem::take(&mut *buffer)
	};
	if records.is_empty() {
		return;
	}
	let rows: Vec<LogRow> = records.into_iter().map(LogRecord::into_row).collect();
	if let Err(err) = store.insert_batch(&rows).await {
		tracing::warn!(error = %err, dropped = rows.len(), "audit flush failed, records lost");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex as StdMutex;

	struct RecordingStore {
		batches: StdMutex<Vec<Vec<LogRow>>>,
	}

	#[async_trait::async_trait]
	impl AuditStore for RecordingStore {
		async fn insert_batch(&self, rows: &[LogRow]) -> Result<(), anyhow::Error> {
			self.batches.lock().unwrap().push(rows.to_vec());
			Ok(())
		}
	}

	fn record(status: Option<u16>, error_code: Option<&str>) -> LogRecord {
		LogRecord {
			app: "app1".to_string(),
			host: "example.com".to_string(),
			method: "GET".to_string(),
			path: "/x?secret=1".to_string(),
			status,
			error_code: error_code.map(str::to_string),
			duration: Duration::from_millis(5),
			request_bytes: 0,
			response_bytes: 0,
			timestamp: None,
		}
	}

	#[test]
	fn strips_query_string() {
		assert_eq!(LogRecord::strip_query("/x?a=1&b=2"), "/x");
		assert_eq!(LogRecord::strip_query("/x"), "/x");
	}

	#[tokio::test]
	async fn error_record_triggers_immediate_flush() {
		let store = Arc::new(RecordingStore { batches: StdMutex::new(vec![]) });
		let logger = AuditLogger::start(store.clone(), 1024, Duration::from_secs(3600));
		logger.log(record(None, Some("NET")));
		tokio::time::sleep(Duration::from_millis(50)).await;
		logger.stop().await;
		let batches = store.batches.lock().unwrap();
		assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 1);
	}

	#[tokio::test]
	async fn full_buffer_drops_non_urgent_records() {
		let store = Arc::new(RecordingStore { batches: StdMutex::new(vec![]) });
		let logger = AuditLogger::start(store, 1, Duration::from_secs(3600));
		logger.log(record(Some(200), None));
		logger.log(record(Some(200), None));
		assert_eq!(logger.stats().dropped, 1);
		logger.stop().await;
	}

	#[tokio::test]
	async fn stop_flushes_remaining_buffer() {
		let store = Arc::new(RecordingStore { batches: StdMutex::new(vec![]) });
		let logger = AuditLogger::start(store.clone(), 1024, Duration::from_secs(3600));
		logger.log(record(Some(200), None));
		logger.stop().await;
		let batches = store.batches.lock().unwrap();
		assert_eq!(batches.iter().map(|b| b.len()).sum::<usize>(), 1);
	}
}
