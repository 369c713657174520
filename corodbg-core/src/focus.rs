//! 選択スレッド・選択フレームの退避と復元

use crate::host::TargetHost;
use crate::session::Session;
use corodbg_target::ThreadId;
use std::ops::{Deref, DerefMut};

/// デバッガのフォーカス（選択中のスレッドとフレーム）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Focus {
    pub thread: Option<ThreadId>,
    /// フィルタ適用後のフレーム番号
    pub frame: usize,
}

/// 作成時のフォーカスを、ドロップ時に復元するガード
///
/// セッションへの可変参照を保持し、ガード越しにコマンドを実行できます。
/// 途中でエラーを返しても、パニックしても、フォーカスとフレームキャッシュは元に戻ります。
pub struct FocusGuard<'s, H: TargetHost> {
    session: &'s mut Session<H>,
    saved: Focus,
}

impl<'s, H: TargetHost> FocusGuard<'s, H> {
    pub(crate) fn new(session: &'s mut Session<H>) -> Self {
        let saved = session.focus();
        Self { session, saved }
    }

    /// 復元されるフォーカス
    pub fn saved(&self) -> Focus {
        self.saved
    }
}

impl<H: TargetHost> Deref for FocusGuard<'_, H> {
    type Target = Session<H>;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<H: TargetHost> DerefMut for FocusGuard<'_, H> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<H: TargetHost> Drop for FocusGuard<'_, H> {
    fn drop(&mut self) {
        self.session.restore_focus(self.saved);
    }
}
