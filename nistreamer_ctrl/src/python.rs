//! Python bindings, built with the `python` feature.
//!
//! Channels are addressed by `(card, chan)` names on the Python side. The wrapped [`Streamer`]
//! uses a [`RecordingBackend`], which makes the module usable for designing and previewing
//! sequences without hardware.
//!
//! ```python
//! from nistreamer_ctrl import Streamer
//!
//! s = Streamer()
//! s.add_ao_card("PXI1Slot3", 1e6)
//! s.add_ao_chan("PXI1Slot3", 0)
//! t = s.sine("PXI1Slot3", "ao0", 0.0, 1.0, amp=1.0, freq=7.0, dc_offset=1.0)
//! s.constant("PXI1Slot3", "ao0", t, 0.5, 1.0)
//! s.compile()
//! sig = s.calc_signal("PXI1Slot3", "ao0", nsamps=1000)
//! ```

use std::sync::Arc;

use numpy::{IntoPyArray, PyArray1};
use pyo3::exceptions::{PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use nistreamer_compiler::*;

use crate::controller::SyncController;
use crate::streamer::Streamer;

fn to_py_err(e: StreamerError) -> PyErr {
    match e {
        StreamerError::UnknownCard { .. } | StreamerError::UnknownChannel { .. } => {
            PyKeyError::new_err(e.to_string())
        }
        StreamerError::NotCompiled(_)
        | StreamerError::Worker { .. }
        | StreamerError::Backend(_) => PyRuntimeError::new_err(e.to_string()),
        _ => PyValueError::new_err(e.to_string()),
    }
}

#[pyclass(name = "Streamer")]
pub struct PyStreamer {
    inner: Streamer,
}

impl PyStreamer {
    fn handle(card: &str, chan: &str) -> ChanHandle {
        ChanHandle::new(card, chan)
    }
}

#[pymethods]
impl PyStreamer {
    #[new]
    fn new() -> Self {
        Self {
            inner: Streamer::new(Arc::new(RecordingBackend::new())),
        }
    }

    // Registration
    fn add_ao_card(&mut self, name: &str, samp_rate: f64) -> PyResult<()> {
        self.inner.add_ao_card(name, samp_rate).map_err(to_py_err)
    }
    fn add_do_card(&mut self, name: &str, samp_rate: f64) -> PyResult<()> {
        self.inner.add_do_card(name, samp_rate).map_err(to_py_err)
    }
    fn remove_card(&mut self, name: &str) -> PyResult<()> {
        self.inner.remove_card(name).map_err(to_py_err)
    }
    #[pyo3(signature = (card, channel_id, default_value=0.0))]
    fn add_ao_chan(&mut self, card: &str, channel_id: usize, default_value: f64) -> PyResult<String> {
        let handle = self
            .inner
            .add_ao_chan(card, channel_id, default_value)
            .map_err(to_py_err)?;
        Ok(handle.chan().to_string())
    }
    #[pyo3(signature = (card, port, line, default_on=false, inverted=false))]
    fn add_do_chan(
        &mut self,
        card: &str,
        port: usize,
        line: usize,
        default_on: bool,
        inverted: bool,
    ) -> PyResult<String> {
        let handle = self
            .inner
            .add_do_chan(card, port, line, default_on, inverted)
            .map_err(to_py_err)?;
        Ok(handle.chan().to_string())
    }
    #[pyo3(signature = (card, idx, lines_per_port, default_on=false, inverted=false))]
    fn add_do_chan_flat(
        &mut self,
        card: &str,
        idx: usize,
        lines_per_port: usize,
        default_on: bool,
        inverted: bool,
    ) -> PyResult<String> {
        let handle = self
            .inner
            .add_do_chan_flat(card, idx, lines_per_port, default_on, inverted)
            .map_err(to_py_err)?;
        Ok(handle.chan().to_string())
    }
    #[pyo3(signature = (card, nickname=None))]
    fn set_card_nickname(&mut self, card: &str, nickname: Option<&str>) -> PyResult<()> {
        self.inner.set_card_nickname(card, nickname).map_err(to_py_err)
    }
    #[pyo3(signature = (card, chan, nickname=None))]
    fn set_chan_nickname(&mut self, card: &str, chan: &str, nickname: Option<&str>) -> PyResult<()> {
        self.inner
            .set_chan_nickname(&Self::handle(card, chan), nickname)
            .map_err(to_py_err)
    }
    fn card_nickname(&self, card: &str) -> PyResult<String> {
        let card = self.inner.card(card).map_err(to_py_err)?;
        Ok(card.nickname().to_string())
    }
    fn chan_nickname(&self, card: &str, chan: &str) -> PyResult<String> {
        let chan = self.inner.chan(&Self::handle(card, chan)).map_err(to_py_err)?;
        Ok(chan.nickname().to_string())
    }
    fn card_info(&self, card: &str) -> PyResult<String> {
        Ok(self.inner.card(card).map_err(to_py_err)?.to_string())
    }

    // Instructions
    #[pyo3(signature = (card, chan, t, dur, value, keep_val=false))]
    fn constant(
        &mut self,
        card: &str,
        chan: &str,
        t: f64,
        dur: f64,
        value: f64,
        keep_val: bool,
    ) -> PyResult<f64> {
        self.inner
            .constant(&Self::handle(card, chan), t, dur, value, keep_val)
            .map_err(to_py_err)
    }
    fn go_constant(&mut self, card: &str, chan: &str, t: f64, value: f64) -> PyResult<f64> {
        self.inner
            .go_constant(&Self::handle(card, chan), t, value)
            .map_err(to_py_err)
    }
    #[pyo3(signature = (card, chan, t, dur, amp, freq, phase=0.0, dc_offset=0.0, keep_val=false))]
    fn sine(
        &mut self,
        card: &str,
        chan: &str,
        t: f64,
        dur: f64,
        amp: f64,
        freq: f64,
        phase: f64,
        dc_offset: f64,
        keep_val: bool,
    ) -> PyResult<f64> {
        let args = SineArgs {
            amp,
            freq,
            phase,
            dc_offset,
        };
        self.inner
            .sine(&Self::handle(card, chan), t, dur, args, keep_val)
            .map_err(to_py_err)
    }
    #[pyo3(signature = (card, chan, t, amp, freq, phase=0.0, dc_offset=0.0))]
    fn go_sine(
        &mut self,
        card: &str,
        chan: &str,
        t: f64,
        amp: f64,
        freq: f64,
        phase: f64,
        dc_offset: f64,
    ) -> PyResult<f64> {
        let args = SineArgs {
            amp,
            freq,
            phase,
            dc_offset,
        };
        self.inner
            .go_sine(&Self::handle(card, chan), t, args)
            .map_err(to_py_err)
    }
    #[pyo3(signature = (card, chan, t, dur, start_val, end_val, keep_val=true))]
    fn ramp(
        &mut self,
        card: &str,
        chan: &str,
        t: f64,
        dur: f64,
        start_val: f64,
        end_val: f64,
        keep_val: bool,
    ) -> PyResult<f64> {
        let args = RampArgs { start_val, end_val };
        self.inner
            .ramp(&Self::handle(card, chan), t, dur, args, keep_val)
            .map_err(to_py_err)
    }
    fn high(&mut self, card: &str, chan: &str, t: f64, dur: f64) -> PyResult<f64> {
        self.inner
            .high(&Self::handle(card, chan), t, dur)
            .map_err(to_py_err)
    }
    fn low(&mut self, card: &str, chan: &str, t: f64, dur: f64) -> PyResult<f64> {
        self.inner
            .low(&Self::handle(card, chan), t, dur)
            .map_err(to_py_err)
    }
    fn go_high(&mut self, card: &str, chan: &str, t: f64) -> PyResult<f64> {
        self.inner
            .go_high(&Self::handle(card, chan), t)
            .map_err(to_py_err)
    }
    fn go_low(&mut self, card: &str, chan: &str, t: f64) -> PyResult<f64> {
        self.inner
            .go_low(&Self::handle(card, chan), t)
            .map_err(to_py_err)
    }
    fn on(&mut self, card: &str, chan: &str, t: f64, dur: f64) -> PyResult<f64> {
        self.inner
            .on(&Self::handle(card, chan), t, dur)
            .map_err(to_py_err)
    }
    fn off(&mut self, card: &str, chan: &str, t: f64, dur: f64) -> PyResult<f64> {
        self.inner
            .off(&Self::handle(card, chan), t, dur)
            .map_err(to_py_err)
    }
    fn go_on(&mut self, card: &str, chan: &str, t: f64) -> PyResult<f64> {
        self.inner
            .go_on(&Self::handle(card, chan), t)
            .map_err(to_py_err)
    }
    fn go_off(&mut self, card: &str, chan: &str, t: f64) -> PyResult<f64> {
        self.inner
            .go_off(&Self::handle(card, chan), t)
            .map_err(to_py_err)
    }
    #[pyo3(signature = (reset_time=None))]
    fn add_reset_instr(&mut self, reset_time: Option<f64>) -> PyResult<f64> {
        self.inner.add_reset_instr(reset_time).map_err(to_py_err)
    }
    fn clear_edit_cache(&mut self) -> PyResult<()> {
        self.inner.clear_edit_cache().map_err(to_py_err)
    }

    // Synchronization
    fn cfg_start_trig(&mut self, card: &str, line: &str, export: bool) -> PyResult<()> {
        self.inner
            .cfg_start_trig(card, line, export)
            .map_err(to_py_err)
    }
    #[pyo3(signature = (card, src=None))]
    fn cfg_samp_clk_src(&mut self, card: &str, src: Option<&str>) -> PyResult<()> {
        self.inner.cfg_samp_clk_src(card, src).map_err(to_py_err)
    }
    #[pyo3(signature = (card, term=None))]
    fn cfg_samp_clk_out(&mut self, card: &str, term: Option<&str>) -> PyResult<()> {
        self.inner.cfg_samp_clk_out(card, term).map_err(to_py_err)
    }
    fn cfg_ref_clk(&mut self, card: &str, line: &str, rate: f64, export: bool) -> PyResult<()> {
        self.inner
            .cfg_ref_clk(card, line, rate, export)
            .map_err(to_py_err)
    }
    #[pyo3(signature = (card=None))]
    fn set_starts_last(&mut self, card: Option<&str>) -> PyResult<()> {
        self.inner.set_starts_last(card).map_err(to_py_err)
    }
    #[pyo3(signature = (card=None, term=None))]
    fn set_ref_clk_provider(&mut self, card: Option<&str>, term: Option<&str>) -> PyResult<()> {
        let provider = match (card, term) {
            (Some(card), Some(term)) => Some((card, term)),
            (None, None) => None,
            _ => {
                return Err(PyValueError::new_err(
                    "card and term must both be given, or both be None",
                ))
            }
        };
        self.inner.set_ref_clk_provider(provider).map_err(to_py_err)
    }
    fn reset_card(&mut self, card: &str) -> PyResult<()> {
        self.inner.reset_card(card).map_err(to_py_err)
    }
    fn reset_all(&mut self) -> PyResult<()> {
        self.inner.reset_all().map_err(to_py_err)
    }

    // Compilation and inspection
    #[pyo3(signature = (stop_time=None))]
    fn compile(&mut self, stop_time: Option<f64>) -> PyResult<f64> {
        self.inner.compile(stop_time).map_err(to_py_err)
    }
    fn last_instr_end_time(&self) -> f64 {
        self.inner.last_instr_end_time()
    }
    fn total_run_time(&self) -> PyResult<f64> {
        self.inner.total_run_time().map_err(to_py_err)
    }
    fn is_edited(&self) -> bool {
        self.inner.is_edited()
    }
    fn is_fresh_compiled(&self) -> bool {
        self.inner.is_fresh_compiled()
    }
    #[pyo3(signature = (card, chan, t_start=None, t_end=None, nsamps=1000))]
    fn calc_signal<'py>(
        &self,
        py: Python<'py>,
        card: &str,
        chan: &str,
        t_start: Option<f64>,
        t_end: Option<f64>,
        nsamps: usize,
    ) -> PyResult<&'py PyArray1<f64>> {
        let signal = self
            .inner
            .calc_signal(&Self::handle(card, chan), t_start, t_end, nsamps)
            .map_err(to_py_err)?;
        Ok(signal.into_pyarray(py))
    }

    // Streaming
    #[pyo3(signature = (nreps=1, bufsize_ms=50.0))]
    fn run(&mut self, nreps: usize, bufsize_ms: f64) -> PyResult<(usize, bool)> {
        let summary = self.inner.run(nreps, bufsize_ms).map_err(to_py_err)?;
        Ok((summary.reps_done, summary.cancelled))
    }
}

#[pymodule]
fn nistreamer_ctrl(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyStreamer>()?;
    Ok(())
}
