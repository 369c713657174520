//! スタックフレームの巻き戻し
//!
//! 最内フレームのレジスタから、登録された巻き戻し器を優先順に問い合わせて
//! 呼び出し元のレジスタを求めていきます。どの巻き戻し器も扱えなければ終端です。
//! 求めたフレーム列は、表示前にフレームフィルタを通します。

use crate::host::TargetHost;
use crate::Result;
use corodbg_coro::ArchProfile;
use corodbg_dwarf::SavedRule;
use corodbg_target::RegisterSet;
use gimli::Register;
use std::rc::Rc;
use tracing::{debug, trace};

/// 巻き戻すフレーム数の上限
pub const MAX_FRAMES: usize = 256;

/// DWARFレジスタ番号をレジスタ名に変換する
///
/// 戻りアドレスの列はプログラムカウンタの名前になります。
pub fn dwarf_register_name(profile: ArchProfile, register: u16) -> Option<&'static str> {
    let name = match profile {
        ArchProfile::X86_64 => gimli::X86_64::register_name(Register(register)),
        ArchProfile::I386 => gimli::X86::register_name(Register(register)),
    }?;
    if name == "RA" {
        Some(profile.layout().pc)
    } else {
        Some(name)
    }
}

/// フレームポインタの名前
pub fn frame_pointer_name(profile: ArchProfile) -> &'static str {
    match profile {
        ArchProfile::X86_64 => "rbp",
        ArchProfile::I386 => "ebp",
    }
}

fn read_word(host: &dyn TargetHost, profile: ArchProfile, address: u64) -> Result<u64> {
    let memory = host.memory();
    match profile.layout().slot_size {
        4 => Ok(memory.read_u32(address as usize)? as u64),
        _ => memory.read_u64(address as usize),
    }
}

/// 1つのスタックフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub sp: u64,
    /// このフレームで有効なレジスタ
    pub regs: RegisterSet,
    /// このフレームを求めた巻き戻し器（最内フレームは None）
    pub unwinder: Option<&'static str>,
}

impl Frame {
    fn from_registers(profile: ArchProfile, regs: RegisterSet, unwinder: Option<&'static str>) -> Result<Self> {
        let layout = profile.layout();
        let pc = regs
            .get(layout.pc)
            .ok_or_else(|| anyhow::anyhow!("Register {} is not available", layout.pc))?;
        let sp = regs
            .get(layout.sp)
            .ok_or_else(|| anyhow::anyhow!("Register {} is not available", layout.sp))?;
        Ok(Self { pc, sp, regs, unwinder })
    }
}

/// 呼び出し元フレームのレジスタを求める巻き戻し器
pub trait FrameUnwinder {
    fn name(&self) -> &'static str;

    /// `frame`（`index` 番目）の呼び出し元のレジスタを返す
    ///
    /// 扱えないフレームなら `Ok(None)` を返し、次の巻き戻し器に任せます。
    fn unwind(
        &self,
        host: &dyn TargetHost,
        profile: ArchProfile,
        frame: &Frame,
        index: usize,
    ) -> Result<Option<RegisterSet>>;

    /// 結果が別のスタックを指してもよいか
    fn switches_stack(&self) -> bool {
        false
    }
}

/// 表示前にフレーム列を書き換えるフィルタ
pub trait FrameFilter {
    fn filter(&self, frames: Vec<Frame>) -> Vec<Frame>;
}

/// `.eh_frame` のCFIによる巻き戻し
pub struct CfiUnwinder;

impl FrameUnwinder for CfiUnwinder {
    fn name(&self) -> &'static str {
        "cfi"
    }

    fn unwind(
        &self,
        host: &dyn TargetHost,
        profile: ArchProfile,
        frame: &Frame,
        index: usize,
    ) -> Result<Option<RegisterSet>> {
        // 呼び出し元フレームのPCは戻りアドレスなので、call命令の内側を引く
        let lookup = if index == 0 { frame.pc } else { frame.pc.saturating_sub(1) };
        let Some(rules) = host.frame_rules(lookup) else {
            return Ok(None);
        };

        let Some(base) = dwarf_register_name(profile, rules.cfa_register).and_then(|r| frame.regs.get(r)) else {
            trace!(register = rules.cfa_register, "CFA register is not available");
            return Ok(None);
        };
        let cfa = base.wrapping_add_signed(rules.cfa_offset);

        let mut caller = frame.regs.clone();
        let mut return_address = None;
        for (register, rule) in &rules.rules {
            let name = dwarf_register_name(profile, *register);
            let value = match rule {
                SavedRule::Undefined => None,
                SavedRule::SameValue => name.and_then(|n| frame.regs.get(n)),
                SavedRule::AtCfaOffset(n) => Some(read_word(host, profile, cfa.wrapping_add_signed(*n))?),
                SavedRule::CfaPlus(n) => Some(cfa.wrapping_add_signed(*n)),
                SavedRule::InRegister(r) => dwarf_register_name(profile, *r).and_then(|n| frame.regs.get(n)),
            };

            if *register == rules.return_address_register {
                return_address = value;
            } else if let (Some(name), Some(value)) = (name, value) {
                caller.set(name, value);
            }
        }

        let Some(return_address) = return_address else {
            return Ok(None);
        };
        let layout = profile.layout();
        caller.set(layout.pc, return_address);
        caller.set(layout.sp, cfa);
        Ok(Some(caller))
    }
}

/// フレームポインタの連鎖による巻き戻し
pub struct FramePointerUnwinder;

impl FrameUnwinder for FramePointerUnwinder {
    fn name(&self) -> &'static str {
        "frame-pointer"
    }

    fn unwind(
        &self,
        host: &dyn TargetHost,
        profile: ArchProfile,
        frame: &Frame,
        _index: usize,
    ) -> Result<Option<RegisterSet>> {
        let fp_name = frame_pointer_name(profile);
        let fp = match frame.regs.get(fp_name) {
            Some(fp) if fp != 0 && fp >= frame.sp => fp,
            _ => return Ok(None),
        };

        let word = profile.layout().slot_size;
        let (Some(ra_slot), Some(caller_sp)) = (fp.checked_add(word), fp.checked_add(2 * word)) else {
            debug!(fp = format_args!("0x{:x}", fp), "frame pointer at the top of the address space");
            return Ok(None);
        };
        let mut caller = frame.regs.clone();
        caller.set(fp_name, read_word(host, profile, fp)?);
        caller.set(profile.layout().pc, read_word(host, profile, ra_slot)?);
        caller.set(profile.layout().sp, caller_sp);
        Ok(Some(caller))
    }
}

/// 巻き戻し器とフィルタを束ねたフレーム列の計算器
pub struct FrameWalker {
    unwinders: Vec<Rc<dyn FrameUnwinder>>,
    filters: Vec<Rc<dyn FrameFilter>>,
}

impl FrameWalker {
    /// 巻き戻し器を持たない計算器（最内フレームだけを返す）
    pub fn new() -> Self {
        Self {
            unwinders: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// CFI、フレームポインタの順に試す計算器
    pub fn with_default_unwinders() -> Self {
        let mut walker = Self::new();
        walker.add_unwinder(Rc::new(CfiUnwinder));
        walker.add_unwinder(Rc::new(FramePointerUnwinder));
        walker
    }

    /// 最も低い優先度で巻き戻し器を追加する
    pub fn add_unwinder(&mut self, unwinder: Rc<dyn FrameUnwinder>) {
        self.unwinders.push(unwinder);
    }

    /// 最も高い優先度で巻き戻し器を追加する
    pub fn prepend_unwinder(&mut self, unwinder: Rc<dyn FrameUnwinder>) {
        self.unwinders.insert(0, unwinder);
    }

    pub fn add_filter(&mut self, filter: Rc<dyn FrameFilter>) {
        self.filters.push(filter);
    }

    /// 最内フレームのレジスタからフレーム列を求める
    pub fn walk(&self, host: &dyn TargetHost, profile: ArchProfile, regs: RegisterSet) -> Result<Vec<Frame>> {
        let mut frames = vec![Frame::from_registers(profile, regs, None)?];

        while frames.len() < MAX_FRAMES {
            let index = frames.len() - 1;
            let frame = &frames[index];
            let Some((unwinder, regs)) = self.step(host, profile, frame, index) else {
                break;
            };

            let caller = match Frame::from_registers(profile, regs, Some(unwinder.name())) {
                Ok(caller) => caller,
                Err(e) => {
                    debug!(index, "unwinder returned incomplete registers: {}", e);
                    break;
                }
            };
            if caller.pc == 0 {
                break;
            }
            if !unwinder.switches_stack() && caller.sp <= frame.sp {
                debug!(
                    index,
                    sp = format_args!("0x{:x}", caller.sp),
                    "stack pointer did not move outward; stopping"
                );
                break;
            }
            frames.push(caller);
        }

        Ok(self.filters.iter().fold(frames, |frames, filter| filter.filter(frames)))
    }

    fn step(
        &self,
        host: &dyn TargetHost,
        profile: ArchProfile,
        frame: &Frame,
        index: usize,
    ) -> Option<(Rc<dyn FrameUnwinder>, RegisterSet)> {
        for unwinder in &self.unwinders {
            match unwinder.unwind(host, profile, frame, index) {
                Ok(Some(regs)) => {
                    trace!(index, unwinder = unwinder.name(), "unwound frame");
                    return Some((Rc::clone(unwinder), regs));
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(index, unwinder = unwinder.name(), "backtrace stopped: {}", e);
                    return None;
                }
            }
        }
        None
    }
}

impl Default for FrameWalker {
    fn default() -> Self {
        Self::with_default_unwinders()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dwarf_register_names() {
        assert_eq!(dwarf_register_name(ArchProfile::X86_64, 7), Some("rsp"));
        assert_eq!(dwarf_register_name(ArchProfile::X86_64, 6), Some("rbp"));
        assert_eq!(dwarf_register_name(ArchProfile::X86_64, 3), Some("rbx"));
        assert_eq!(dwarf_register_name(ArchProfile::X86_64, 16), Some("rip"));
        assert_eq!(dwarf_register_name(ArchProfile::I386, 4), Some("esp"));
        assert_eq!(dwarf_register_name(ArchProfile::I386, 8), Some("eip"));
    }
}
