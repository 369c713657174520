//! デバッグ対象へのアクセスの抽象化
//!
//! コマンドはこのトレイト越しにスレッド・レジスタ・メモリ・型情報を参照します。
//! 実プロセス用の実装は [`crate::live::LiveTarget`] です。

use crate::Result;
use corodbg_dwarf::{FrameRules, MemoryReader, TypeId, TypeTable};
use corodbg_target::{RegisterSet, Thread, ThreadId};

/// 変数の実行時アドレスと型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableRef {
    pub address: u64,
    pub ty: TypeId,
}

/// 停止中のデバッグ対象
pub trait TargetHost {
    /// 実行ファイルのアーキテクチャ名（"x86_64" など）
    fn arch_name(&self) -> &str;

    /// スレッド一覧（番号順）
    fn threads(&self) -> Vec<Thread>;

    /// スレッドの実レジスタ
    fn thread_registers(&self, tid: ThreadId) -> Result<RegisterSet>;

    fn memory(&self) -> &dyn MemoryReader;

    fn types(&self) -> &TypeTable;

    /// グローバル変数またはスレッドローカル変数を解決する
    ///
    /// スレッドローカル変数は `tid` のスレッドのブロックで解決します。
    /// 変数が存在しなければ `Ok(None)` です。
    fn variable(&self, tid: ThreadId, name: &str) -> Result<Option<VariableRef>>;

    /// アドレスを `symbol+off` 形式にする
    fn symbolize(&self, address: u64) -> Option<String>;

    /// アドレスのソース位置（`file:line`）
    fn source_line(&self, address: u64) -> Option<String>;

    /// 実行時アドレスにおけるCFIのフレーム規則
    fn frame_rules(&self, pc: u64) -> Option<FrameRules>;
}
