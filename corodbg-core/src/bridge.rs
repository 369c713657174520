//! コルーチンのスタックへの巻き戻しの差し込み
//!
//! [`UnwindBridge`] は最も優先度の高い巻き戻し器です。レジスタセットで武装すると、
//! 次の巻き戻しの問い合わせ1回にだけそのレジスタを返し、直後に武装を解きます。
//! その結果、最内フレーム（スレッド自身のフレーム）の呼び出し元として
//! コルーチンの中断地点が現れ、以降は通常の巻き戻し器がコルーチンのスタックを辿ります。
//!
//! 最内フレームは差し込みの副産物なので、[`SkipFirstFrame`] が有効な間は表示から除きます。
//! 両者の状態は [`ArmGuard`] の寿命に閉じ込め、コマンド1回より長く残しません。

use crate::host::TargetHost;
use crate::unwind::{Frame, FrameFilter, FrameUnwinder};
use crate::Result;
use corodbg_coro::ArchProfile;
use corodbg_target::RegisterSet;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

/// 1回だけ使える差し込み用の巻き戻し器
#[derive(Debug, Default)]
pub struct UnwindBridge {
    armed: RefCell<Option<RegisterSet>>,
}

impl UnwindBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.borrow().is_some()
    }

    /// 武装を解く（武装していなければ何もしない）
    pub fn disarm(&self) {
        self.armed.borrow_mut().take();
    }

    fn replace(&self, regs: Option<RegisterSet>) -> Option<RegisterSet> {
        self.armed.replace(regs)
    }
}

impl FrameUnwinder for UnwindBridge {
    fn name(&self) -> &'static str {
        "coroutine"
    }

    fn unwind(
        &self,
        _host: &dyn TargetHost,
        _profile: ArchProfile,
        _frame: &Frame,
        index: usize,
    ) -> Result<Option<RegisterSet>> {
        let regs = self.armed.borrow_mut().take();
        if regs.is_some() {
            debug!(index, "injecting coroutine registers");
        }
        Ok(regs)
    }

    fn switches_stack(&self) -> bool {
        true
    }
}

/// 有効な間、先頭のフレームを1つ除くフィルタ
#[derive(Debug, Default)]
pub struct SkipFirstFrame {
    enabled: Cell<bool>,
}

impl SkipFirstFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }
}

impl FrameFilter for SkipFirstFrame {
    fn filter(&self, frames: Vec<Frame>) -> Vec<Frame> {
        if self.enabled.get() {
            frames.into_iter().skip(1).collect()
        } else {
            frames
        }
    }
}

/// 差し込みの武装状態を保持するガード
///
/// ドロップ時に、武装前の状態（通常は未武装・フィルタ無効）に戻します。
/// 内側のコマンドが失敗しても、パニックしても同じです。
#[must_use]
pub struct ArmGuard {
    bridge: Rc<UnwindBridge>,
    filter: Rc<SkipFirstFrame>,
    previous_regs: Option<RegisterSet>,
    previous_filter: bool,
}

impl ArmGuard {
    /// レジスタセットで武装し、先頭フレームのフィルタを有効にする
    pub fn arm(bridge: &Rc<UnwindBridge>, filter: &Rc<SkipFirstFrame>, regs: RegisterSet) -> Self {
        Self::install(bridge, filter, Some(regs), true)
    }

    /// 武装を解きフィルタを無効にした状態を、ガードの寿命の間だけ作る
    ///
    /// 外側のコマンドの差し込みを、スレッド自身のフレームを見る内側のコマンドに漏らさないために使います。
    pub fn suspend(bridge: &Rc<UnwindBridge>, filter: &Rc<SkipFirstFrame>) -> Self {
        Self::install(bridge, filter, None, false)
    }

    fn install(
        bridge: &Rc<UnwindBridge>,
        filter: &Rc<SkipFirstFrame>,
        regs: Option<RegisterSet>,
        enabled: bool,
    ) -> Self {
        let previous_regs = bridge.replace(regs);
        let previous_filter = filter.enabled.replace(enabled);
        Self {
            bridge: Rc::clone(bridge),
            filter: Rc::clone(filter),
            previous_regs,
            previous_filter,
        }
    }
}

impl Drop for ArmGuard {
    fn drop(&mut self) {
        self.bridge.replace(self.previous_regs.take());
        self.filter.enabled.set(self.previous_filter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pc: u64) -> Frame {
        Frame {
            pc,
            sp: 0x1000,
            regs: RegisterSet::new(),
            unwinder: None,
        }
    }

    #[test]
    fn test_skip_first_frame_only_when_enabled() {
        let filter = Rc::new(SkipFirstFrame::new());
        let frames = vec![frame(1), frame(2), frame(3)];
        assert_eq!(filter.filter(frames.clone()).len(), 3);

        let bridge = Rc::new(UnwindBridge::new());
        let guard = ArmGuard::arm(&bridge, &filter, RegisterSet::new());
        let filtered = filter.filter(frames.clone());
        assert_eq!(filtered.iter().map(|f| f.pc).collect::<Vec<_>>(), vec![2, 3]);
        drop(guard);
        assert_eq!(filter.filter(frames).len(), 3);
    }

    #[test]
    fn test_guard_disarms_unused_bridge() {
        let bridge = Rc::new(UnwindBridge::new());
        let filter = Rc::new(SkipFirstFrame::new());
        {
            let _guard = ArmGuard::arm(&bridge, &filter, [("rip", 1u64)].into_iter().collect());
            assert!(bridge.is_armed());
            assert!(filter.is_enabled());
        }
        assert!(!bridge.is_armed());
        assert!(!filter.is_enabled());
    }

    #[test]
    fn test_suspend_hides_outer_arming() {
        let bridge = Rc::new(UnwindBridge::new());
        let filter = Rc::new(SkipFirstFrame::new());
        let outer = ArmGuard::arm(&bridge, &filter, [("rip", 0x401234)].into_iter().collect());
        {
            let _inner = ArmGuard::suspend(&bridge, &filter);
            assert!(!bridge.is_armed());
            assert!(!filter.is_enabled());
            assert_eq!(filter.filter(vec![frame(1), frame(2)]).len(), 2);
        }
        assert!(bridge.is_armed());
        assert!(filter.is_enabled());
        drop(outer);
        assert!(!bridge.is_armed());
        assert!(!filter.is_enabled());
    }

    #[test]
    fn test_nested_guard_restores_outer_state() {
        let bridge = Rc::new(UnwindBridge::new());
        let filter = Rc::new(SkipFirstFrame::new());
        let outer_regs: RegisterSet = [("rip", 1u64)].into_iter().collect();
        let _outer = ArmGuard::arm(&bridge, &filter, outer_regs.clone());
        {
            let _inner = ArmGuard::arm(&bridge, &filter, [("rip", 2u64)].into_iter().collect());
        }
        assert!(filter.is_enabled());
        assert_eq!(bridge.replace(None), Some(outer_regs));
    }
}
