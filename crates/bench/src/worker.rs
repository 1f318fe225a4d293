//! Per-endpoint transfer thread
//!
//! Each active endpoint direction gets one worker. The worker moves data
//! until the test is cancelled or its retry budget is spent, feeding the
//! shared statistics after every transfer, and then drains its window.

use crate::config::TransferMode;
use crate::pipeline::{EndpointTarget, PipelineWindow};
use crate::stats::{self, SharedStats};
use crate::verify::VerifyPattern;
use common::Semaphore;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use xfer::{EndpointKind, TransferError};

/// Cancellation flags shared by the monitor and every worker
#[derive(Debug, Default)]
pub struct TestControl {
    cancelled: AtomicBool,
    user_aborted: AtomicBool,
}

impl TestControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the test
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Stop the test on the user's request
    pub fn abort(&self) {
        self.user_aborted.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_user_aborted(&self) -> bool {
        self.user_aborted.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub mode: TransferMode,
    pub buffer_size: usize,
    pub buffer_count: usize,
    pub timeout: Duration,
    pub retry: u32,
    /// Checked against received data; only used on IN endpoints
    pub verify: Option<Arc<VerifyPattern>>,
}

/// Buffers a worker transfers from
///
/// `Prefilled` holds one buffer per window slot, e.g. the data pattern for
/// a verified loop test.
#[derive(Debug, Clone)]
pub enum WorkerBuffers {
    Zeroed,
    Prefilled(Vec<Vec<u8>>),
}

pub struct EndpointWorker {
    target: EndpointTarget,
    settings: WorkerSettings,
    buffers: WorkerBuffers,
    control: Arc<TestControl>,
    stats: SharedStats,
    running: Arc<AtomicBool>,
    finished: Arc<Semaphore>,
}

/// Handle to a spawned worker
pub struct WorkerHandle {
    endpoint: u8,
    stats: SharedStats,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Endpoint {:#04x}: worker thread panicked", self.endpoint);
        }
    }
}

enum Outcome {
    Continue,
    Stop,
}

impl EndpointWorker {
    /// `finished` is released once when the worker has drained and stopped
    pub fn new(
        target: EndpointTarget,
        settings: WorkerSettings,
        buffers: WorkerBuffers,
        control: Arc<TestControl>,
        stats: SharedStats,
        finished: Arc<Semaphore>,
    ) -> Self {
        Self {
            target,
            settings,
            buffers,
            control,
            stats,
            running: Arc::new(AtomicBool::new(false)),
            finished,
        }
    }

    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let endpoint = self.target.endpoint;
        let stats = self.stats.clone();
        let running = self.running.clone();

        running.store(true, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("bench-ep{:02x}", endpoint))
            .spawn(move || self.run());

        match spawned {
            Ok(thread) => Ok(WorkerHandle {
                endpoint,
                stats,
                running,
                thread: Some(thread),
            }),
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Run on the calling thread until stopped
    pub fn run(self) {
        self.running.store(true, Ordering::SeqCst);
        let endpoint = self.target.endpoint;

        match self.settings.mode {
            TransferMode::Sync => self.run_sync(),
            TransferMode::Async => self.run_async(),
        }

        self.running.store(false, Ordering::SeqCst);
        self.finished.release();
        info!(
            "Endpoint {:#04x}: thread stopped. user-abort={}",
            endpoint,
            if self.control.is_user_aborted() { 'Y' } else { 'N' }
        );
    }

    fn run_sync(&self) {
        let mut buffer = match &self.buffers {
            WorkerBuffers::Prefilled(buffers) if !buffers.is_empty() => buffers[0].clone(),
            _ => vec![0u8; self.settings.buffer_size],
        };

        while !self.control.is_cancelled() {
            let result = self.transfer_sync(&mut buffer);
            let data = match &result {
                Ok(len) => &buffer[..(*len).min(buffer.len())],
                Err(_) => &[][..],
            };
            if let Outcome::Stop = self.account(result.as_ref().map(|len| *len), data) {
                break;
            }
        }
    }

    fn run_async(&self) {
        let mut window = match &self.buffers {
            WorkerBuffers::Prefilled(buffers) => PipelineWindow::with_buffers(
                self.target.clone(),
                buffers.clone(),
                self.settings.buffer_size,
                self.settings.timeout,
            ),
            WorkerBuffers::Zeroed => PipelineWindow::new(
                self.target.clone(),
                self.settings.buffer_count,
                self.settings.buffer_size,
                self.settings.timeout,
            ),
        };

        while !self.control.is_cancelled() {
            let result = window.pump();
            if let Err(e) = &result
                && !self.control.is_cancelled()
                && !e.is_timeout()
            {
                error!(
                    "Endpoint {:#04x}: transfer window failed: {}",
                    self.target.endpoint, e
                );
            }
            let data = match &result {
                Ok(reaped) => window.data(*reaped),
                Err(_) => &[][..],
            };
            let length = result.as_ref().map(|reaped| reaped.length);
            if let Outcome::Stop = self.account(length, data) {
                break;
            }
        }

        window.drain(self.control.is_user_aborted());
    }

    fn transfer_sync(&self, buffer: &mut [u8]) -> xfer::Result<usize> {
        let session = &self.target.session;
        let device = self.target.device.as_ref();
        let endpoint = self.target.endpoint;
        let timeout = self.settings.timeout;
        let len = self.settings.buffer_size.min(buffer.len());
        let data = &mut buffer[..len];

        match (self.target.kind, self.target.is_in()) {
            (EndpointKind::Interrupt, true) => session.interrupt_read(device, endpoint, data, timeout),
            (EndpointKind::Interrupt, false) => {
                session.interrupt_write(device, endpoint, data, timeout)
            }
            (_, true) => session.bulk_read(device, endpoint, data, timeout),
            (_, false) => session.bulk_write(device, endpoint, data, timeout),
        }
    }

    /// Classify one transfer result and update the statistics
    fn account(&self, result: Result<usize, &TransferError>, data: &[u8]) -> Outcome {
        let endpoint = self.target.endpoint;
        let retry = self.settings.retry;

        let mismatches = match (&result, &self.settings.verify) {
            (Ok(_), Some(pattern)) if self.target.is_in() => pattern.verify(data).mismatches,
            _ => 0,
        };

        let mut stats = stats::lock(&self.stats);
        let length = match result {
            Err(e) if e.is_timeout() => {
                stats.record_timeout();
                warn!("Endpoint {:#04x}: timeout #{}..", endpoint, stats.running_timeouts);
                if self.control.is_user_aborted() || stats.running_timeouts > retry {
                    return Outcome::Stop;
                }
                0
            }
            Err(TransferError::NoDevice) => {
                // Nothing left to retry against
                if !self.control.is_user_aborted() {
                    stats.record_error();
                    error!("Endpoint {:#04x}: device is gone", endpoint);
                }
                return Outcome::Stop;
            }
            Err(e) => {
                if self.control.is_user_aborted() {
                    return Outcome::Stop;
                }
                stats.record_error();
                error!(
                    "Endpoint {:#04x}: transfer failed ({} of {}): {}",
                    endpoint,
                    stats.running_errors,
                    retry + 1,
                    e
                );
                if stats.running_errors > retry {
                    return Outcome::Stop;
                }
                0
            }
            Ok(len) if len < self.settings.buffer_size && !self.control.is_cancelled() => {
                warn!(
                    "Endpoint {:#04x}: short transfer, expected {} got {}",
                    endpoint, self.settings.buffer_size, len
                );
                if len > 0 {
                    stats.record_short();
                } else {
                    stats.record_error();
                    if stats.running_errors > retry {
                        return Outcome::Stop;
                    }
                }
                len
            }
            Ok(len) => {
                stats.clear_running();
                len
            }
        };

        if mismatches > 0 {
            stats.record_mismatches(mismatches);
        }
        stats.record_transfer(length, Instant::now());
        Outcome::Continue
    }
}
