//! Interface to the native streaming backend.
//!
//! The backend owns everything that touches the driver: registering devices and channels,
//! programming trigger and clock terminals, writing samples and running tasks. This crate only
//! decides *what* to issue and in which order.
//!
//! Run lifecycle operations are per card (`cfg_run`, `start`, `stream_run`, `close_run`) so that
//! the controller can enforce the cross-card start order itself.
//!
//! [`RecordingBackend`] is an in-memory implementation that records every call. It is used for
//! dry runs and in tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::BackendError;
use crate::instruction::Instruction;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

pub trait StreamBackend: Send + Sync {
    // Device and channel registration
    fn add_analog_device(&self, name: &str, samp_rate: f64) -> BackendResult<()>;
    fn add_digital_device(&self, name: &str, samp_rate: f64) -> BackendResult<()>;
    fn add_analog_channel(&self, device: &str, channel_id: usize, default_value: f64)
        -> BackendResult<()>;
    fn add_digital_channel(
        &self,
        device: &str,
        port: usize,
        line: usize,
        default_value: bool,
    ) -> BackendResult<()>;

    // Timeline mutation
    fn emit(&self, device: &str, channel: &str, instr: &Instruction) -> BackendResult<()>;
    fn clear_edit_cache(&self) -> BackendResult<()>;
    fn compile(&self, stop_time: Option<f64>) -> BackendResult<f64>;

    // Synchronization configuration
    fn set_start_trig_in(&self, device: &str, term: Option<&str>) -> BackendResult<()>;
    fn set_start_trig_out(&self, device: &str, term: Option<&str>) -> BackendResult<()>;
    fn set_samp_clk_in(&self, device: &str, term: Option<&str>) -> BackendResult<()>;
    fn set_samp_clk_out(&self, device: &str, term: Option<&str>) -> BackendResult<()>;
    fn set_ref_clk_in(&self, device: &str, term: Option<&str>) -> BackendResult<()>;
    fn set_min_bufwrite_timeout(&self, device: &str, timeout: Option<f64>) -> BackendResult<()>;
    fn connect_terms(&self, src: &str, dest: &str) -> BackendResult<()>;
    fn disconnect_terms(&self, src: &str, dest: &str) -> BackendResult<()>;
    fn device_reset(&self, name: &str) -> BackendResult<()>;

    // Run lifecycle, issued per card from its worker thread
    fn cfg_run(&self, device: &str, bufsize_ms: f64) -> BackendResult<()>;
    fn start(&self, device: &str) -> BackendResult<()>;
    fn stream_run(&self, device: &str, calc_next: bool) -> BackendResult<()>;
    fn close_run(&self, device: &str) -> BackendResult<()>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum BackendCall {
    AddAnalogDevice { name: String, samp_rate: f64 },
    AddDigitalDevice { name: String, samp_rate: f64 },
    AddAnalogChannel { device: String, channel_id: usize, default_value: f64 },
    AddDigitalChannel { device: String, port: usize, line: usize, default_value: bool },
    Emit { device: String, channel: String, instr: Instruction },
    ClearEditCache,
    Compile(Option<f64>),
    SetStartTrigIn { device: String, term: Option<String> },
    SetStartTrigOut { device: String, term: Option<String> },
    SetSampClkIn { device: String, term: Option<String> },
    SetSampClkOut { device: String, term: Option<String> },
    SetRefClkIn { device: String, term: Option<String> },
    SetMinBufwriteTimeout { device: String, timeout: Option<f64> },
    ConnectTerms { src: String, dest: String },
    DisconnectTerms { src: String, dest: String },
    DeviceReset(String),
    CfgRun { device: String, bufsize_ms: f64 },
    Start(String),
    StreamRun { device: String, calc_next: bool },
    CloseRun(String),
}

type StreamHook = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Backend that performs no I/O and records every call in order.
///
/// Failures can be injected per call with [`RecordingBackend::fail_on`]; a matching call is
/// still recorded, then returns an error.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<Vec<BackendCall>>,
    connections: Mutex<BTreeSet<(String, String)>>,
    stream_hook: Mutex<Option<StreamHook>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear()
    }

    /// Position of the first recorded call equal to `call`.
    pub fn position(&self, call: &BackendCall) -> Option<usize> {
        self.calls.lock().iter().position(|c| c == call)
    }

    pub fn count(&self, pred: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn fail_on(&self, call: BackendCall) {
        self.failures.lock().push(call)
    }

    /// Runs `hook(device, calc_next)` inside every `stream_run` call.
    pub fn set_stream_hook(&self, hook: impl Fn(&str, bool) + Send + Sync + 'static) {
        *self.stream_hook.lock() = Some(Arc::new(hook));
    }

    pub fn is_connected(&self, src: &str, dest: &str) -> bool {
        self.connections
            .lock()
            .contains(&(src.to_string(), dest.to_string()))
    }

    pub fn connections(&self) -> Vec<(String, String)> {
        self.connections.lock().iter().cloned().collect()
    }

    fn record(&self, call: BackendCall) -> BackendResult<()> {
        let fail = self.failures.lock().contains(&call);
        let msg = format!("injected failure on {call:?}");
        self.calls.lock().push(call);
        if fail {
            Err(BackendError::new(msg))
        } else {
            Ok(())
        }
    }
}

fn term(term: Option<&str>) -> Option<String> {
    term.map(str::to_string)
}

impl StreamBackend for RecordingBackend {
    fn add_analog_device(&self, name: &str, samp_rate: f64) -> BackendResult<()> {
        self.record(BackendCall::AddAnalogDevice {
            name: name.to_string(),
            samp_rate,
        })
    }
    fn add_digital_device(&self, name: &str, samp_rate: f64) -> BackendResult<()> {
        self.record(BackendCall::AddDigitalDevice {
            name: name.to_string(),
            samp_rate,
        })
    }
    fn add_analog_channel(
        &self,
        device: &str,
        channel_id: usize,
        default_value: f64,
    ) -> BackendResult<()> {
        self.record(BackendCall::AddAnalogChannel {
            device: device.to_string(),
            channel_id,
            default_value,
        })
    }
    fn add_digital_channel(
        &self,
        device: &str,
        port: usize,
        line: usize,
        default_value: bool,
    ) -> BackendResult<()> {
        self.record(BackendCall::AddDigitalChannel {
            device: device.to_string(),
            port,
            line,
            default_value,
        })
    }
    fn emit(&self, device: &str, channel: &str, instr: &Instruction) -> BackendResult<()> {
        self.record(BackendCall::Emit {
            device: device.to_string(),
            channel: channel.to_string(),
            instr: *instr,
        })
    }
    fn clear_edit_cache(&self) -> BackendResult<()> {
        self.record(BackendCall::ClearEditCache)
    }
    fn compile(&self, stop_time: Option<f64>) -> BackendResult<f64> {
        self.record(BackendCall::Compile(stop_time))?;
        Ok(stop_time.unwrap_or(0.0))
    }
    fn set_start_trig_in(&self, device: &str, term_: Option<&str>) -> BackendResult<()> {
        self.record(BackendCall::SetStartTrigIn {
            device: device.to_string(),
            term: term(term_),
        })
    }
    fn set_start_trig_out(&self, device: &str, term_: Option<&str>) -> BackendResult<()> {
        self.record(BackendCall::SetStartTrigOut {
            device: device.to_string(),
            term: term(term_),
        })
    }
    fn set_samp_clk_in(&self, device: &str, term_: Option<&str>) -> BackendResult<()> {
        self.record(BackendCall::SetSampClkIn {
            device: device.to_string(),
            term: term(term_),
        })
    }
    fn set_samp_clk_out(&self, device: &str, term_: Option<&str>) -> BackendResult<()> {
        self.record(BackendCall::SetSampClkOut {
            device: device.to_string(),
            term: term(term_),
        })
    }
    fn set_ref_clk_in(&self, device: &str, term_: Option<&str>) -> BackendResult<()> {
        self.record(BackendCall::SetRefClkIn {
            device: device.to_string(),
            term: term(term_),
        })
    }
    fn set_min_bufwrite_timeout(&self, device: &str, timeout: Option<f64>) -> BackendResult<()> {
        self.record(BackendCall::SetMinBufwriteTimeout {
            device: device.to_string(),
            timeout,
        })
    }
    fn connect_terms(&self, src: &str, dest: &str) -> BackendResult<()> {
        self.record(BackendCall::ConnectTerms {
            src: src.to_string(),
            dest: dest.to_string(),
        })?;
        self.connections
            .lock()
            .insert((src.to_string(), dest.to_string()));
        Ok(())
    }
    fn disconnect_terms(&self, src: &str, dest: &str) -> BackendResult<()> {
        self.record(BackendCall::DisconnectTerms {
            src: src.to_string(),
            dest: dest.to_string(),
        })?;
        self.connections
            .lock()
            .remove(&(src.to_string(), dest.to_string()));
        Ok(())
    }
    fn device_reset(&self, name: &str) -> BackendResult<()> {
        self.record(BackendCall::DeviceReset(name.to_string()))
    }
    fn cfg_run(&self, device: &str, bufsize_ms: f64) -> BackendResult<()> {
        self.record(BackendCall::CfgRun {
            device: device.to_string(),
            bufsize_ms,
        })
    }
    fn start(&self, device: &str) -> BackendResult<()> {
        self.record(BackendCall::Start(device.to_string()))
    }
    fn stream_run(&self, device: &str, calc_next: bool) -> BackendResult<()> {
        let hook = self.stream_hook.lock().clone();
        if let Some(hook) = hook {
            hook(device, calc_next);
        }
        self.record(BackendCall::StreamRun {
            device: device.to_string(),
            calc_next,
        })
    }
    fn close_run(&self, device: &str) -> BackendResult<()> {
        self.record(BackendCall::CloseRun(device.to_string()))
    }
}

#[cfg(test)]
mod test {
    use crate::backend::*;

    #[test]
    fn injected_failure_is_recorded_then_returned() {
        let backend = RecordingBackend::new();
        backend.fail_on(BackendCall::Start("PXI1Slot4".to_string()));
        assert!(backend.start("PXI1Slot3").is_ok());
        assert!(backend.start("PXI1Slot4").is_err());
        assert_eq!(backend.calls().len(), 2);
    }

    #[test]
    fn tracks_terminal_connections() {
        let backend = RecordingBackend::new();
        backend
            .connect_terms("/PXI1Slot3/10MHzRefClock", "/PXI1Slot3/PXI_Trig7")
            .unwrap();
        assert!(backend.is_connected("/PXI1Slot3/10MHzRefClock", "/PXI1Slot3/PXI_Trig7"));
        backend
            .disconnect_terms("/PXI1Slot3/10MHzRefClock", "/PXI1Slot3/PXI_Trig7")
            .unwrap();
        assert!(backend.connections().is_empty());
    }
}
