use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCmd {
    /// Resume (`true`) or suspend (`false`) polling without ending the worker.
    Poll(bool),
    Close,
}

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
        // A receiver created on a used channel only reacts to messages posted after it
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
    pub fn recv(&mut self) -> Result<WorkerCmd, String> {
        let mut mutex_guard = self.cmd.lock();
        while mutex_guard.0 == self.viewed_msg_num {
            self.condvar.wait(&mut mutex_guard);
        }
        let (msg_num, cmd_val) = *mutex_guard;
        drop(mutex_guard);
        self.take(msg_num, cmd_val)
    }

    /// Waits at most `timeout` for the next command. `Ok(None)` means the period elapsed with
    /// nothing posted; the poll worker uses this as its tick.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<WorkerCmd>, String> {
        let mut mutex_guard = self.cmd.lock();
        if mutex_guard.0 == self.viewed_msg_num {
            self.condvar.wait_for(&mut mutex_guard, timeout);
        }
        let (msg_num, cmd_val) = *mutex_guard;
        drop(mutex_guard);
        if msg_num == self.viewed_msg_num {
            return Ok(None);
        }
        self.take(msg_num, cmd_val).map(Some)
    }

    fn take(&mut self, msg_num: usize, cmd: WorkerCmd) -> Result<WorkerCmd, String> {
        if msg_num != self.viewed_msg_num + 1 {
            return Err(format!(
                "Viewed msg count {} diverged from the published command number {}",
                self.viewed_msg_num, msg_num
            ));
        }
        self.viewed_msg_num = msg_num;
        Ok(cmd)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recv_timeout_ticks_then_receives() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        assert_eq!(recvr.recv_timeout(Duration::from_millis(1)), Ok(None));

        chan.send(WorkerCmd::Poll(false));
        assert_eq!(recvr.recv_timeout(Duration::from_millis(1)), Ok(Some(WorkerCmd::Poll(false))));
        assert_eq!(recvr.recv_timeout(Duration::from_millis(1)), Ok(None));
    }

    #[test]
    fn missed_command_is_reported() {
        let chan = CmdChan::new();
        let mut recvr = chan.new_recvr();
        chan.send(WorkerCmd::Poll(true));
        chan.send(WorkerCmd::Close);
        assert!(recvr.recv().is_err());
    }

    #[test]
    fn receiver_ignores_earlier_messages() {
        let chan = CmdChan::new();
        chan.send(WorkerCmd::Poll(true));
        let mut recvr = chan.new_recvr();
        assert_eq!(recvr.recv_timeout(Duration::from_millis(1)), Ok(None));
        let sender = std::thread::spawn(move || chan.send(WorkerCmd::Close));
        assert_eq!(recvr.recv(), Ok(WorkerCmd::Close));
        sender.join().unwrap();
    }
}
