//! corodbg コルーチンランタイム解析
//!
//! 停止中のプロセスに埋め込まれた協調型（スタックフル）コルーチンスケジューラの
//! 内部状態をメモリから読み取ります。型付きのリモート参照、侵入型リストの走査、
//! スケジューラごとのコルーチン列挙、保存コンテキストからのレジスタ復元を行います。
//!
//! ターゲットのメモリを書き換えることはありません。

pub mod error;
pub mod remote;
pub mod list;
pub mod layout;
pub mod scheduler;
pub mod context;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::{InspectError, Result};
pub use remote::{field_offset, lookup_type, RemoteValue};
pub use list::{ListBound, ListWalker, DUMP_LIST_LIMIT};
pub use layout::RuntimeLayout;
pub use scheduler::{AnchorState, Coroutine, CoroutineEnumerator, CoroutineSet, CoroutineState};
pub use context::{reconstruct, ArchProfile, SaveLayout};
