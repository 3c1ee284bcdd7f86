//! Per-card streaming worker.
//!
//! One worker thread is spawned per active card for the duration of a run. The worker configures
//! its card, reports back, and then reacts on broadcast [`WorkerCmd`]s until told to close:
//!
//! ```text
//! cfg_run -> report -> { Stream -> start (ordered) -> stream_run -> report }* -> Close -> close_run -> report
//! ```
//!
//! Every step is reported on the worker's own channel, including failures. A failed step does not
//! end the loop, so the controller can always close every card it configured.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Sender;
use tracing::{debug, error};

use nistreamer_compiler::{Result, StreamBackend, StreamerError, TickTimer};

use crate::utils::StartLatch;
use crate::worker_cmd_chan::{CmdRecvr, WorkerCmd};

pub struct Worker {
    card: String,
    backend: Arc<dyn StreamBackend>,
    starts_last: bool,
}

impl Worker {
    pub fn new(card: &str, backend: Arc<dyn StreamBackend>, starts_last: bool) -> Self {
        Self {
            card: card.to_string(),
            backend,
            starts_last,
        }
    }

    pub fn card(&self) -> &str {
        &self.card
    }

    pub fn spawn(
        self,
        bufsize_ms: f64,
        cmd_recvr: CmdRecvr,
        report_sendr: Sender<Result<()>>,
    ) -> Result<JoinHandle<()>> {
        let card = self.card.clone();
        thread::Builder::new()
            .name(format!("{card}_worker"))
            .spawn(move || {
                if let Err(e) = self.worker_loop(bufsize_ms, cmd_recvr, report_sendr) {
                    error!("card {} worker stopped: {e}", self.card);
                }
            })
            .map_err(|e| StreamerError::Worker {
                card,
                msg: format!("failed to spawn worker thread: {e}"),
            })
    }

    fn report(&self, report_sendr: &Sender<Result<()>>, res: Result<()>) -> Result<()> {
        if let Err(e) = &res {
            error!("card {}: {e}", self.card);
        }
        report_sendr.send(res).map_err(|_| StreamerError::Worker {
            card: self.card.clone(),
            msg: "controller stopped listening to reports".to_string(),
        })
    }

    fn worker_loop(
        &self,
        bufsize_ms: f64,
        mut cmd_recvr: CmdRecvr,
        report_sendr: Sender<Result<()>>,
    ) -> Result<()> {
        let mut timer = TickTimer::new();
        let res = self.backend.cfg_run(&self.card, bufsize_ms).map_err(StreamerError::from);
        timer.tick_log(&format!("{} cfg_run", self.card));
        self.report(&report_sendr, res)?;

        loop {
            match cmd_recvr.recv(&self.card)? {
                WorkerCmd::Stream { calc_next, latch } => {
                    let res = self.stream_run_(calc_next, &latch);
                    timer.tick_log(&format!("{} stream_run", self.card));
                    self.report(&report_sendr, res)?;
                }
                WorkerCmd::Close => {
                    let res = self.backend.close_run(&self.card).map_err(StreamerError::from);
                    timer.tick_log(&format!("{} close_run", self.card));
                    self.report(&report_sendr, res)?;
                    break;
                }
            }
        }
        Ok(())
    }

    fn stream_run_(&self, calc_next: bool, latch: &StartLatch) -> Result<()> {
        // The held back card starts only after every other card returned from start
        if self.starts_last {
            if !latch.wait() {
                return Err(StreamerError::Worker {
                    card: self.card.clone(),
                    msg: "another card failed to start, not starting".to_string(),
                });
            }
            self.backend.start(&self.card)?;
        } else {
            let started = self.backend.start(&self.card);
            latch.count_down(started.is_ok());
            started?;
        }
        debug!("card {} started (calc_next = {calc_next})", self.card);
        self.backend.stream_run(&self.card, calc_next)?;
        Ok(())
    }
}
