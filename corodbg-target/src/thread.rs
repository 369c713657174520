//! スレッド管理機能

use crate::Result;
use std::fs;

/// スレッドID（LWP ID）
pub type ThreadId = i32;

/// デバッグ対象のスレッド
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    tid: ThreadId,
    /// 1始まりのスレッド番号（アタッチ時に決まる）
    num: u32,
    /// 表示名（/proc/<pid>/task/<tid>/comm）
    name: String,
}

impl Thread {
    /// スレッドを作成する
    pub fn new(tid: ThreadId, num: u32, name: impl Into<String>) -> Self {
        Self {
            tid,
            num,
            name: name.into(),
        }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// スレッド番号を取得する
    pub fn num(&self) -> u32 {
        self.num
    }

    /// 表示名を取得する
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// プロセスに属するスレッドIDを列挙する
///
/// メインスレッド（tid == pid）を先頭に、残りを昇順で返します。
pub fn list_thread_ids(pid: i32) -> Result<Vec<ThreadId>> {
    let task_dir = format!("/proc/{}/task", pid);
    let entries = fs::read_dir(&task_dir)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir, e))?;

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse::<ThreadId>().ok()) {
            tids.push(tid);
        }
    }

    sort_main_first(&mut tids, pid);
    Ok(tids)
}

/// スレッドの表示名を読み取る（読めなければ空文字列）
pub fn read_thread_name(pid: i32, tid: ThreadId) -> String {
    fs::read_to_string(format!("/proc/{}/task/{}/comm", pid, tid))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}

fn sort_main_first(tids: &mut [ThreadId], pid: i32) {
    tids.sort_by_key(|&tid| (tid != pid, tid));
}
