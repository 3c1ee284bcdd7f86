use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use nistreamer_compiler::StreamerError;

use crate::utils::StartLatch;

#[derive(Clone)]
pub enum WorkerCmd {
    /// Stream one repetition. All workers of one run share the same latch.
    Stream {
        calc_next: bool,
        latch: Arc<StartLatch>,
    },
    Close,
}

/// Broadcast channel: every receiver sees every command, in order.
pub struct CmdChan {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>, // (msg_num: usize, worker_cmd: WorkerCmd)
    condvar: Arc<Condvar>,
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, WorkerCmd::Close))),
            condvar: Arc::new(Condvar::new()),
        }
    }
    pub fn new_recvr(&self) -> CmdRecvr {
        // The first message a new receiver reacts on is the next posted one
        let (msg_num, _cmd_val) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }
    pub fn send(&self, cmd: WorkerCmd) {
        let mut mutex_guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *mutex_guard;
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    /// Blocks until the next command is posted.
    ///
    /// The sender waits for every worker report before posting again, so a receiver falling more
    /// than one message behind is an error.
    pub fn recv(&mut self, card: &str) -> Result<WorkerCmd, StreamerError> {
        let mut mutex_guard = self.cmd.lock();
        while mutex_guard.0 == self.viewed_msg_num {
            self.condvar.wait(&mut mutex_guard);
        }
        let (msg_num, cmd_val) = &*mutex_guard;
        if *msg_num != self.viewed_msg_num + 1 {
            return Err(StreamerError::Worker {
                card: card.to_string(),
                msg: format!(
                    "viewed msg count {} diverged from the published command number {msg_num}",
                    self.viewed_msg_num
                ),
            });
        }
        self.viewed_msg_num += 1;
        Ok(cmd_val.clone())
    }
}
