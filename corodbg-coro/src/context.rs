//! 保存コンテキストからのレジスタ復元
//!
//! コンテキスト切り替えルーチンは、callee-saved レジスタを決まった順に積んでから
//! スタックポインタを保存します。保存されたスタックポインタから昇順に
//!
//! ```text
//! sp + 0           : 最後に積んだレジスタ
//! ...
//! sp + n*slot      : 戻りアドレス（再開時の PC）
//! sp + (n+1)*slot  : 再開時のスタックポインタ
//! ```
//!
//! と並びます。アーキテクチャごとの違いは `SaveLayout` の表だけです。

use crate::error::{InspectError, Result};
use corodbg_dwarf::MemoryReader;
use corodbg_target::RegisterSet;
use tracing::debug;

/// 保存領域のレイアウト
#[derive(Debug, PartialEq, Eq)]
pub struct SaveLayout {
    /// 1スロットのバイト数
    pub slot_size: u64,
    /// sp から昇順に並ぶ callee-saved レジスタ
    pub saved: &'static [&'static str],
    /// プログラムカウンタの名前
    pub pc: &'static str,
    /// スタックポインタの名前
    pub sp: &'static str,
}

impl SaveLayout {
    /// 戻りアドレスのスロットのオフセット
    pub fn return_address_offset(&self) -> u64 {
        self.saved.len() as u64 * self.slot_size
    }

    /// 再開時のスタックポインタのオフセット
    pub fn restored_sp_offset(&self) -> u64 {
        self.return_address_offset() + self.slot_size
    }
}

static X86_64_LAYOUT: SaveLayout = SaveLayout {
    slot_size: 8,
    saved: &["r15", "r14", "r13", "r12", "rbx", "rbp"],
    pc: "rip",
    sp: "rsp",
};

static I386_LAYOUT: SaveLayout = SaveLayout {
    slot_size: 4,
    saved: &["edi", "esi", "ebx", "ebp"],
    pc: "eip",
    sp: "esp",
};

/// 対応しているアーキテクチャ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchProfile {
    X86_64,
    I386,
}

impl ArchProfile {
    /// アーキテクチャ名から判定する
    ///
    /// 対応していない名前は `UnsupportedArchitecture` です。
    pub fn from_arch_name(name: &str) -> Result<Self> {
        match name {
            "x86_64" | "i386:x86-64" | "x86-64" => Ok(ArchProfile::X86_64),
            "i386" | "i686" | "x86" => Ok(ArchProfile::I386),
            other => Err(InspectError::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArchProfile::X86_64 => "x86_64",
            ArchProfile::I386 => "i386",
        }
    }

    pub fn layout(&self) -> &'static SaveLayout {
        match self {
            ArchProfile::X86_64 => &X86_64_LAYOUT,
            ArchProfile::I386 => &I386_LAYOUT,
        }
    }
}

/// 保存スタックポインタからレジスタセットを復元する
///
/// 結果は PC、SP、callee-saved レジスタの順です。
pub fn reconstruct(profile: ArchProfile, saved_sp: u64, memory: &dyn MemoryReader) -> Result<RegisterSet> {
    let layout = profile.layout();
    if saved_sp == 0 {
        return Err(InspectError::malformed("coroutine has no saved stack pointer"));
    }

    let restored_sp = saved_sp.checked_add(layout.restored_sp_offset()).ok_or_else(|| {
        InspectError::malformed(format!("saved stack pointer 0x{:x} is outside the address space", saved_sp))
    })?;

    let slots = layout.saved.len() + 1;
    let bytes = memory
        .read(saved_sp as usize, slots * layout.slot_size as usize)
        .map_err(|e| InspectError::memory(saved_sp, e))?;

    let slot = |i: usize| -> u64 {
        let size = layout.slot_size as usize;
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&bytes[i * size..(i + 1) * size]);
        u64::from_le_bytes(buf)
    };

    let mut set = RegisterSet::new();
    set.set(layout.pc, slot(layout.saved.len()));
    set.set(layout.sp, restored_sp);
    for (i, name) in layout.saved.iter().enumerate() {
        set.set(*name, slot(i));
    }

    debug!(
        arch = profile.name(),
        saved_sp = format_args!("0x{:x}", saved_sp),
        pc = format_args!("0x{:x}", slot(layout.saved.len())),
        "reconstructed coroutine registers"
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockMemory;

    #[test]
    fn test_x86_64_layout() {
        let sp = 0x7fff_1000;
        let mut mem = MockMemory::new();
        for (i, value) in [15u64, 14, 13, 12, 0xb, 0x7fff_2000, 0x40_1234].iter().enumerate() {
            mem.write_u64(sp + i as u64 * 8, *value);
        }

        let regs = reconstruct(ArchProfile::X86_64, sp, &mem).unwrap();
        assert_eq!(regs.get("rip"), Some(0x40_1234));
        assert_eq!(regs.get("rsp"), Some(sp + 56));
        assert_eq!(regs.get("rbp"), Some(0x7fff_2000));
        assert_eq!(regs.get("rbx"), Some(0xb));
        assert_eq!(regs.get("r15"), Some(15));
        assert_eq!(regs.get("r12"), Some(12));
        let names: Vec<&str> = regs.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["rip", "rsp", "r15", "r14", "r13", "r12", "rbx", "rbp"]);
    }

    #[test]
    fn test_i386_layout() {
        let sp = 0xbfff_0000;
        let mut mem = MockMemory::new();
        for (i, value) in [1u32, 2, 3, 0xbfff_0100, 0x0804_8000].iter().enumerate() {
            mem.write_u32(sp + i as u64 * 4, *value);
        }

        let regs = reconstruct(ArchProfile::I386, sp, &mem).unwrap();
        assert_eq!(regs.get("eip"), Some(0x0804_8000));
        assert_eq!(regs.get("esp"), Some(sp + 20));
        assert_eq!(regs.get("edi"), Some(1));
        assert_eq!(regs.get("ebp"), Some(0xbfff_0100));
    }

    #[test]
    fn test_unsupported_architecture_reads_nothing() {
        let mem = MockMemory::new();
        let result = ArchProfile::from_arch_name("aarch64").and_then(|p| reconstruct(p, 0x1000, &mem));
        assert!(matches!(
            result,
            Err(InspectError::UnsupportedArchitecture(name)) if name == "aarch64"
        ));
        assert_eq!(mem.reads.get(), 0);
    }

    #[test]
    fn test_arch_names() {
        assert_eq!(ArchProfile::from_arch_name("i386:x86-64").unwrap(), ArchProfile::X86_64);
        assert_eq!(ArchProfile::from_arch_name("i386").unwrap(), ArchProfile::I386);
        assert_eq!(ArchProfile::X86_64.layout().return_address_offset(), 48);
        assert_eq!(ArchProfile::I386.layout().restored_sp_offset(), 20);
    }

    #[test]
    fn test_null_sp_and_unreadable_stack() {
        let mem = MockMemory::new();
        assert!(matches!(
            reconstruct(ArchProfile::X86_64, 0, &mem),
            Err(InspectError::MalformedRuntimeState(_))
        ));
        assert!(matches!(
            reconstruct(ArchProfile::X86_64, 0x5000, &mem),
            Err(InspectError::MemoryRead { address: 0x5000, .. })
        ));
        assert!(matches!(
            reconstruct(ArchProfile::X86_64, u64::MAX - 8, &mem),
            Err(InspectError::MalformedRuntimeState(_))
        ));
        assert_eq!(mem.reads.get(), 1);
    }
}
