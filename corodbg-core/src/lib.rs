//! corodbg デバッガのコア機能
//!
//! このクレートは、停止中のプロセスに対するコマンドセッションを提供します。
//! スタックの巻き戻し、コルーチンの文脈への巻き戻しの差し込み、フォーカスの退避と復元、
//! コマンドのパースとスレッド・コルーチンのセレクタ解決を統合します。

pub mod host;
pub mod live;
pub mod unwind;
pub mod bridge;
pub mod focus;
pub mod command;
pub mod select;
pub mod session;
pub mod parse;

pub use host::{TargetHost, VariableRef};
pub use live::LiveTarget;
pub use unwind::{CfiUnwinder, Frame, FrameFilter, FramePointerUnwinder, FrameUnwinder, FrameWalker, MAX_FRAMES};
pub use bridge::{ArmGuard, SkipFirstFrame, UnwindBridge};
pub use focus::{Focus, FocusGuard};
pub use command::{Command, CoroutineTarget, ParseError};
pub use session::{Flow, Session};

// 他のクレートから使用するために再エクスポート
pub use corodbg_coro::{InspectError, RuntimeLayout};
pub use corodbg_target::{RegisterSet, Thread, ThreadId};

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
