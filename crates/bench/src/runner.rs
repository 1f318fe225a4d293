//! Test setup and the running test as seen by the monitor loop

use crate::config::{BenchConfig, TransferMode};
use crate::device::{DeviceError, EndpointInfo, check_buffer_size, select_endpoint};
use crate::display;
use crate::firmware::TestType;
use crate::pipeline::EndpointTarget;
use crate::stats::{self, SharedStats};
use crate::verify::{VerifyPattern, fill_pattern};
use crate::worker::{EndpointWorker, TestControl, WorkerBuffers, WorkerHandle, WorkerSettings};
use common::Semaphore;
use std::sync::Arc;
use tracing::debug;
use xfer::driver::ENDPOINT_IN;
use xfer::{DeviceIo, EndpointKind, Session};

/// One endpoint direction of a planned test
#[derive(Debug)]
pub struct EndpointPlan {
    pub info: EndpointInfo,
    pub target: EndpointTarget,
    pub buffers: WorkerBuffers,
}

/// Everything needed to start the workers
#[derive(Debug)]
pub struct TestPlan {
    pub mode: TransferMode,
    pub read: Option<EndpointPlan>,
    pub write: Option<EndpointPlan>,
    pub verify: Option<Arc<VerifyPattern>>,
}

/// Resolve endpoints, buffers and the verification pattern for `config`
pub fn plan_test(
    config: &BenchConfig,
    session: &Session,
    device: Arc<dyn DeviceIo>,
    endpoints: &[EndpointInfo],
) -> Result<TestPlan, DeviceError> {
    let test = &config.test;
    let endpoint_number = config.device.endpoint & 0x0F;

    let resolve = |requested: u8| -> Result<EndpointInfo, DeviceError> {
        let info = select_endpoint(endpoints, requested)?;
        check_buffer_size(test.buffer_size, &info)?;
        Ok(info)
    };
    let read_info = match test.test_type.reads() {
        true => Some(resolve(endpoint_number | ENDPOINT_IN)?),
        false => None,
    };
    let write_info = match test.test_type.writes() {
        true => Some(resolve(endpoint_number)?),
        false => None,
    };

    let mut mode = test.effective_mode();
    let has_iso = [read_info, write_info]
        .iter()
        .flatten()
        .any(|info| info.kind == EndpointKind::Isochronous);
    if has_iso && mode != TransferMode::Async {
        debug!("Isochronous endpoint selected, using async transfers");
        mode = TransferMode::Async;
    }

    let verify = match (test.verify, write_info, read_info) {
        (false, _, _) => None,
        (true, Some(write), Some(_)) => Some(write.max_packet_size),
        (true, None, Some(read)) => Some(read.max_packet_size),
        (true, _, None) => None,
    }
    .map(|packet_size| Arc::new(VerifyPattern::new(usize::from(packet_size), test.verify_details)));

    let target = |info: &EndpointInfo| EndpointTarget {
        session: session.clone(),
        device: device.clone(),
        kind: info.kind,
        endpoint: info.address,
        iso_packet_size: match test.iso_packet_size {
            0 => usize::from(info.max_packet_size),
            size => size,
        },
    };

    let read = read_info.map(|info| EndpointPlan {
        info,
        target: target(&info),
        buffers: WorkerBuffers::Zeroed,
    });

    let write = write_info.map(|info| {
        let buffers = if test.verify && test.test_type == TestType::Loop {
            WorkerBuffers::Prefilled(prefilled_buffers(
                test.buffer_count,
                test.buffer_size,
                usize::from(info.max_packet_size),
            ))
        } else {
            WorkerBuffers::Zeroed
        };
        EndpointPlan {
            info,
            target: target(&info),
            buffers,
        }
    });

    Ok(TestPlan {
        mode,
        read,
        write,
        verify,
    })
}

/// Write buffers carrying the data pattern, keys running across all slots
pub fn prefilled_buffers(buffer_count: usize, buffer_size: usize, packet_size: usize) -> Vec<Vec<u8>> {
    let mut data = vec![0u8; buffer_count * buffer_size];
    fill_pattern(&mut data, packet_size);
    data.chunks(buffer_size.max(1)).map(<[u8]>::to_vec).collect()
}

/// Worker threads of a started test
pub struct RunningTest {
    control: Arc<TestControl>,
    finished: Arc<Semaphore>,
    read: Option<(EndpointInfo, WorkerHandle)>,
    write: Option<(EndpointInfo, WorkerHandle)>,
}

impl RunningTest {
    /// Spawn one worker per planned endpoint
    pub fn start(plan: TestPlan, config: &BenchConfig) -> std::io::Result<Self> {
        let control = Arc::new(TestControl::new());
        let finished = Arc::new(Semaphore::new(0, 2));
        let test = &config.test;

        let spawn = |endpoint: EndpointPlan, verify: Option<Arc<VerifyPattern>>| {
            let settings = WorkerSettings {
                mode: plan.mode,
                buffer_size: test.buffer_size,
                buffer_count: test.buffer_count,
                timeout: test.timeout(),
                retry: test.retry,
                verify,
            };
            let worker = EndpointWorker::new(
                endpoint.target,
                settings,
                endpoint.buffers,
                control.clone(),
                // Each worker locks only its own record
                stats::shared(),
                finished.clone(),
            );
            worker.spawn().map(|handle| (endpoint.info, handle))
        };

        let mut running = Self {
            control: control.clone(),
            finished: finished.clone(),
            read: None,
            write: None,
        };
        if let Some(read) = plan.read {
            running.read = Some(spawn(read, plan.verify.clone())?);
        }
        if let Some(write) = plan.write {
            match spawn(write, None) {
                Ok(handle) => running.write = Some(handle),
                Err(e) => {
                    running.stop(false);
                    return Err(e);
                }
            }
        }
        Ok(running)
    }

    fn workers(&self) -> impl Iterator<Item = &(EndpointInfo, WorkerHandle)> {
        self.read.iter().chain(self.write.iter())
    }

    /// Whether some worker has stopped on its own
    pub fn any_stopped(&self) -> bool {
        self.workers().any(|(_, handle)| !handle.is_running())
    }

    pub fn reset_averages(&self) {
        for (_, handle) in self.workers() {
            stats::lock(handle.stats()).reset();
        }
    }

    /// Status line for the read endpoint, or the write endpoint in a write test
    pub fn status_line(&self) -> Option<String> {
        let (_, handle) = self.read.as_ref().or(self.write.as_ref())?;
        let snapshot = stats::lock(handle.stats()).take_status();
        Some(display::format_running_status(&snapshot))
    }

    pub fn transfer_info(&self) -> String {
        self.workers()
            .map(|(info, handle)| {
                let snapshot = stats::lock(handle.stats()).clone();
                display::format_transfer_info(info, &snapshot)
            })
            .collect()
    }

    /// Statistics of every worker, read endpoint first
    pub fn stats(&self) -> Vec<(EndpointInfo, SharedStats)> {
        self.workers()
            .map(|(info, handle)| (*info, handle.stats().clone()))
            .collect()
    }

    /// Cancel the test and wait for every worker to drain
    pub fn stop(&mut self, user_aborted: bool) {
        if user_aborted {
            self.control.abort();
        } else {
            self.control.cancel();
        }

        let count = self.workers().count();
        for _ in 0..count {
            self.finished.wait(None);
        }
        for (_, handle) in self.read.iter_mut().chain(self.write.iter_mut()) {
            handle.join();
        }
    }
}
