//! プロセス制御機能

use crate::thread::{list_thread_ids, read_thread_name};
use crate::{Result, Thread, ThreadId};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// アタッチ中に新しいスレッドが生まれ続けた場合の再走査上限
const MAX_ATTACH_ROUNDS: usize = 16;

/// デバッグ対象のプロセス
///
/// 全スレッドに ptrace でアタッチし、停止させた状態を保持します。
/// ドロップ時にすべてのスレッドからデタッチします。
pub struct Process {
    pid: Pid,
    threads: Vec<Thread>,
}

impl Process {
    /// 既存のプロセスの全スレッドにアタッチする
    ///
    /// アタッチ中に生成されたスレッドを取りこぼさないよう、
    /// /proc/<pid>/task を新しいスレッドが見つからなくなるまで再走査します。
    pub fn attach(pid: i32) -> Result<Self> {
        let mut attached: Vec<ThreadId> = Vec::new();

        for round in 0..MAX_ATTACH_ROUNDS {
            let tids = list_thread_ids(pid)?;
            let fresh: Vec<ThreadId> = tids
                .into_iter()
                .filter(|tid| !attached.contains(tid))
                .collect();

            if fresh.is_empty() {
                break;
            }

            for tid in fresh {
                match attach_thread(tid) {
                    Ok(()) => attached.push(tid),
                    Err(e) => {
                        // 既に終了したスレッドは無視する
                        warn!(tid, round, "failed to attach thread: {}", e);
                    }
                }
            }
        }

        if attached.is_empty() {
            return Err(anyhow::anyhow!("Failed to attach to any thread of process {}", pid));
        }

        // 番号付けはメインスレッド先頭・tid昇順で固定する
        let mut ordered = attached;
        ordered.sort_by_key(|&tid| (tid != pid, tid));

        let threads = ordered
            .into_iter()
            .enumerate()
            .map(|(i, tid)| Thread::new(tid, i as u32 + 1, read_thread_name(pid, tid)))
            .collect::<Vec<_>>();

        debug!(pid, count = threads.len(), "attached to process");

        Ok(Self {
            pid: Pid::from_raw(pid),
            threads,
        })
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// アタッチ済みのスレッド一覧を取得する
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        for thread in &self.threads {
            let _ = ptrace::detach(Pid::from_raw(thread.tid()), None);
        }
    }
}

/// 1スレッドにアタッチし、停止するまで待機する
fn attach_thread(tid: ThreadId) -> Result<()> {
    let pid = Pid::from_raw(tid);
    ptrace::attach(pid)?;

    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => return Ok(()),
            WaitStatus::Stopped(_, signal) => {
                // SIGSTOP以外で止まった場合も停止状態として扱う
                debug!(tid, ?signal, "thread stopped by another signal during attach");
                return Ok(());
            }
            WaitStatus::Exited(_, code) => {
                return Err(anyhow::anyhow!("Thread {} exited with code {}", tid, code));
            }
            WaitStatus::Signaled(_, signal, _) => {
                return Err(anyhow::anyhow!("Thread {} killed by {:?}", tid, signal));
            }
            _ => continue,
        }
    }
}
