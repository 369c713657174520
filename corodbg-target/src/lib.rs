//! corodbg ターゲットプロセス制御
//!
//! このクレートは、停止中のデバッグ対象プロセスを読み取るための低レベル機能を提供します。
//! 全スレッドへの ptrace アタッチ、スレッド列挙、レジスタ読み取り、メモリ読み取りを行います。
//! 対象プロセスの状態を書き換える操作は提供しません。

pub mod process;
pub mod thread;
pub mod memory;
pub mod registers;

pub use process::Process;
pub use thread::{Thread, ThreadId};
pub use memory::{Memory, MemoryMapping};
pub use registers::{RegisterSet, Registers};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
