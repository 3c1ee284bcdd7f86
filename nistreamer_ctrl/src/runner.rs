use serde::{Deserialize, Serialize};
use tracing::info;

use nistreamer_compiler::Result;

use crate::controller::SyncController;
use crate::utils::CancelToken;

/// Run parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamCfg {
    /// Duration of sample data written per buffer, in milliseconds.
    pub bufsize_ms: f64,
    pub nreps: usize,
}

impl Default for StreamCfg {
    fn default() -> Self {
        Self {
            bufsize_ms: 50.0,
            nreps: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub reps_done: usize,
    pub cancelled: bool,
}

/// Drives one full run: a single `cfg_run`, up to `nreps` repetitions, a single close.
///
/// Cancellation is checked before every repetition and truncates the run without an error.
pub struct StreamRunner {
    cfg: StreamCfg,
    cancel: CancelToken,
}

impl StreamRunner {
    pub fn new(cfg: StreamCfg) -> Self {
        Self::with_cancel(cfg, CancelToken::new())
    }

    pub fn with_cancel(cfg: StreamCfg, cancel: CancelToken) -> Self {
        Self { cfg, cancel }
    }

    pub fn cfg(&self) -> &StreamCfg {
        &self.cfg
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run<S: SyncController>(&self, streamer: &mut S) -> Result<RunSummary> {
        let nreps = self.cfg.nreps;
        let mut guard = streamer.cfg_run(self.cfg.bufsize_ms)?;
        let mut summary = RunSummary {
            reps_done: 0,
            cancelled: false,
        };
        let mut stream_res: Result<()> = Ok(());
        for rep in 0..nreps {
            if self.cancel.is_cancelled() {
                info!("run cancelled after {rep} of {nreps} repetitions");
                summary.cancelled = true;
                break;
            }
            if let Err(e) = guard.stream_run(rep + 1 < nreps) {
                stream_res = Err(e);
                break;
            }
            summary.reps_done += 1;
        }
        // Stream error takes precedence over the close error
        let close_res = guard.close();
        stream_res?;
        close_res?;
        info!("run finished: {summary:?}");
        Ok(summary)
    }
}

#[cfg(test)]
mod test {
    use crate::runner::*;

    #[test]
    fn stream_cfg_defaults() {
        let cfg: StreamCfg = serde_json::from_str(r#"{"nreps": 3}"#).unwrap();
        assert_eq!(
            cfg,
            StreamCfg {
                bufsize_ms: 50.0,
                nreps: 3
            }
        );
        let cfg: StreamCfg = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, StreamCfg::default());
    }
}
