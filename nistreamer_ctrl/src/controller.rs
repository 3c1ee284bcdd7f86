//! Run lifecycle across cards.
//!
//! [`SyncController::cfg_run`] turns a freshly compiled registry into a configured run and hands
//! out a [`RunGuard`]. The guard holds the registry's exclusive borrow, so timelines cannot change
//! while cards are streaming, and it always closes the run: explicitly through
//! [`RunGuard::close`], or on drop.
//!
//! ## Start ordering
//! Cards importing a start trigger or a clock must be armed before the card providing it starts.
//! If `starts_last` names an active card, its worker waits on a [`StartLatch`] until every other
//! worker returned from its backend `start` call. All other cards start concurrently.
//!
//! ## Reference clock
//! The `ref_clk_provider` card exports its 10 MHz reference clock by a static terminal connection
//! which lives exactly as long as the run.

use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver};
use tracing::{error, info, warn};

use nistreamer_compiler::*;

use crate::runner::*;
use crate::utils::StartLatch;
use crate::worker::Worker;
use crate::worker_cmd_chan::{CmdChan, WorkerCmd};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Configured,
    Running,
}

struct WorkerHandle {
    card: String,
    report_recvr: Receiver<Result<()>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn recv_report(&self) -> Result<()> {
        match self.report_recvr.recv() {
            Ok(res) => res,
            Err(_) => Err(StreamerError::Worker {
                card: self.card.clone(),
                msg: "worker thread exited without reporting".to_string(),
            }),
        }
    }
}

fn keep_first(first_err: &mut Option<StreamerError>, res: Result<()>) {
    if let Err(e) = res {
        first_err.get_or_insert(e);
    }
}

pub trait SyncController: BaseExperiment + Sized {
    /// Configures one worker per active card and returns the guard of the configured run.
    ///
    /// Requires a fresh compiled program. Whatever was set up before a failure is torn down
    /// before the error is returned.
    fn cfg_run(&mut self, bufsize_ms: f64) -> Result<RunGuard<'_>> {
        if !bufsize_ms.is_finite() || bufsize_ms <= 0.0 {
            return Err(StreamerError::InvalidRange(format!(
                "bufsize_ms must be positive, got {bufsize_ms}"
            )));
        }
        let active_cards = self.compiled_program()?.active_cards();
        if active_cards.is_empty() {
            return Err(StreamerError::NotCompiled(
                "no card has instructions to stream".to_string(),
            ));
        }
        self.check_sync_state()?;

        let sync = self.sync_state().clone();
        let starts_last = match sync.starts_last {
            Some(name) if active_cards.contains(&name) => Some(name),
            Some(name) => {
                warn!("card {name} is designated to start last but has nothing to stream");
                None
            }
            None => None,
        };
        let mut guard = RunGuard::new(self.backend().clone(), starts_last);

        if let Some((card, term)) = sync.ref_clk_provider {
            let src = format!("/{card}/10MHzRefClock");
            let dest = format!("/{card}/{term}");
            guard.backend.connect_terms(&src, &dest)?;
            info!("exporting reference clock {src} -> {dest}");
            guard.ref_clk_export = Some((src, dest));
        }

        let mut first_err = None;
        for card in active_cards.iter() {
            let (report_sendr, report_recvr) = unbounded();
            let is_last = guard.starts_last.as_deref() == Some(card.as_str());
            let worker = Worker::new(card, guard.backend.clone(), is_last);
            match worker.spawn(bufsize_ms, guard.cmd_chan.new_recvr(), report_sendr) {
                Ok(handle) => guard.workers.push(WorkerHandle {
                    card: card.clone(),
                    report_recvr,
                    handle: Some(handle),
                }),
                Err(e) => {
                    first_err = Some(e);
                    break;
                }
            }
        }
        for worker in guard.workers.iter() {
            keep_first(&mut first_err, worker.recv_report());
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        guard.state = RunState::Configured;
        info!("configured run on cards {active_cards:?} with {bufsize_ms} ms buffers");
        Ok(guard)
    }

    /// Streams `nreps` repetitions: one `cfg_run`, `nreps` `stream_run`, one `close_run`.
    fn run(&mut self, nreps: usize, bufsize_ms: f64) -> Result<RunSummary> {
        StreamRunner::new(StreamCfg { bufsize_ms, nreps }).run(self)
    }
}

/// A configured run. Closing happens on drop if [`RunGuard::close`] was not called.
pub struct RunGuard<'a> {
    backend: Arc<dyn StreamBackend>,
    cmd_chan: CmdChan,
    workers: Vec<WorkerHandle>,
    starts_last: Option<String>,
    ref_clk_export: Option<(String, String)>,
    state: RunState,
    closed: bool,
    _registry: PhantomData<&'a mut ()>,
}

impl<'a> RunGuard<'a> {
    fn new(backend: Arc<dyn StreamBackend>, starts_last: Option<String>) -> Self {
        Self {
            backend,
            cmd_chan: CmdChan::new(),
            workers: Vec::new(),
            starts_last,
            ref_clk_export: None,
            state: RunState::Idle,
            closed: false,
            _registry: PhantomData,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn cards(&self) -> Vec<&str> {
        self.workers.iter().map(|w| w.card.as_str()).collect()
    }

    /// Streams one repetition on every card. `calc_next` lets the cards prepare the first
    /// buffer of the next repetition while the current one finishes.
    ///
    /// Returns the first error reported by any card, after all cards reported.
    pub fn stream_run(&mut self, calc_next: bool) -> Result<()> {
        let held_back = self.starts_last.as_deref();
        let count = self
            .workers
            .iter()
            .filter(|w| Some(w.card.as_str()) != held_back)
            .count();
        self.state = RunState::Running;
        self.cmd_chan.send(WorkerCmd::Stream {
            calc_next,
            latch: Arc::new(StartLatch::new(count)),
        });
        let mut first_err = None;
        for worker in self.workers.iter() {
            keep_first(&mut first_err, worker.recv_report());
        }
        self.state = RunState::Configured;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Closes every card, joins the workers and reverts the reference clock export.
    /// Every step is attempted; the first error is returned.
    pub fn close(mut self) -> Result<()> {
        self.close_()
    }

    fn close_(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;

        if !self.workers.is_empty() {
            self.cmd_chan.send(WorkerCmd::Close);
        }
        for worker in self.workers.iter() {
            keep_first(&mut first_err, worker.recv_report());
        }
        for worker in self.workers.iter_mut() {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    first_err.get_or_insert(StreamerError::Worker {
                        card: worker.card.clone(),
                        msg: "worker thread panicked".to_string(),
                    });
                }
            }
        }
        if let Some((src, dest)) = self.ref_clk_export.take() {
            let res = self.backend.disconnect_terms(&src, &dest);
            keep_first(&mut first_err, res.map_err(StreamerError::from));
        }
        self.state = RunState::Idle;
        info!("run closed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<'a> Drop for RunGuard<'a> {
    fn drop(&mut self) {
        if let Err(e) = self.close_() {
            error!("closing run failed: {e}");
        }
    }
}
