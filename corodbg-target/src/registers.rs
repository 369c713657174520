//! レジスタアクセス機能

use crate::{Result, ThreadId};
use nix::unistd::Pid;
use std::fmt;

/// 名前付きレジスタ値の集合
///
/// 挿入順を保持します。スレッドの実レジスタからも、
/// コルーチンの保存領域から復元した値からも構築されます。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet {
    values: Vec<(&'static str, u64)>,
}

impl RegisterSet {
    /// 空のレジスタセットを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// レジスタ値を設定する（既存の値は上書き）
    pub fn set(&mut self, name: &'static str, value: u64) {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    /// レジスタ値を取得する
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    /// 全レジスタを挿入順に列挙する
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(&'static str, u64)> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = (&'static str, u64)>>(iter: I) -> Self {
        let mut set = RegisterSet::new();
        for (name, value) in iter {
            set.set(name, value);
        }
        set
    }
}

impl fmt::Display for RegisterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.values {
            writeln!(f, "{:<8} 0x{:016x}  {}", name, value, value)?;
        }
        Ok(())
    }
}

/// スレッドのレジスタアクセス
pub struct Registers {
    tid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self {
            tid: Pid::from_raw(tid),
        }
    }

    /// 汎用レジスタを読み取り、名前付きセットとして返す
    ///
    /// TLSアドレス計算のため `fs_base` も含めます。
    #[cfg(target_arch = "x86_64")]
    pub fn read_set(&self) -> Result<RegisterSet> {
        let regs = nix::sys::ptrace::getregs(self.tid)?;
        Ok([
            ("rax", regs.rax),
            ("rbx", regs.rbx),
            ("rcx", regs.rcx),
            ("rdx", regs.rdx),
            ("rsi", regs.rsi),
            ("rdi", regs.rdi),
            ("rbp", regs.rbp),
            ("rsp", regs.rsp),
            ("r8", regs.r8),
            ("r9", regs.r9),
            ("r10", regs.r10),
            ("r11", regs.r11),
            ("r12", regs.r12),
            ("r13", regs.r13),
            ("r14", regs.r14),
            ("r15", regs.r15),
            ("rip", regs.rip),
            ("eflags", regs.eflags),
            ("fs_base", regs.fs_base),
        ]
        .into_iter()
        .collect())
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn read_set(&self) -> Result<RegisterSet> {
        Err(anyhow::anyhow!(
            "Reading thread registers is only supported on x86_64 hosts (thread {})",
            self.tid
        ))
    }
}
