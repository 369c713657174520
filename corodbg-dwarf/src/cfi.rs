//! CFI（Call Frame Information）によるフレーム規則の検索
//!
//! `.eh_frame` から、あるPCにおけるCFAの求め方と、呼び出し元のレジスタが
//! 保存されている場所を取り出します。アドレスはファイル内の仮想アドレスです。

use crate::Result;
use gimli::{BaseAddresses, CfaRule, EhFrame, RegisterRule, UnwindContext, UnwindSection};
use object::{Object, ObjectSection};
use tracing::{debug, trace};

type EhSlice = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// 呼び出し元レジスタの保存規則
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavedRule {
    Undefined,
    SameValue,
    /// `[CFA + n]` に保存されている
    AtCfaOffset(i64),
    /// 値そのものが `CFA + n`
    CfaPlus(i64),
    /// 別のレジスタに保存されている
    InRegister(u16),
}

/// あるPCにおけるフレーム規則（DWARFレジスタ番号で表す）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRules {
    pub cfa_register: u16,
    pub cfa_offset: i64,
    pub rules: Vec<(u16, SavedRule)>,
    pub return_address_register: u16,
}

impl FrameRules {
    /// レジスタの保存規則（記載がなければ None）
    pub fn rule_for(&self, register: u16) -> Option<SavedRule> {
        self.rules.iter().find(|(r, _)| *r == register).map(|(_, rule)| *rule)
    }
}

/// `.eh_frame` の検索表
pub struct CfiTable {
    eh_frame: Option<EhFrame<EhSlice>>,
    bases: BaseAddresses,
}

impl CfiTable {
    /// オブジェクトファイルの `.eh_frame` から作成する
    ///
    /// セクションがない場合は空の表になります（常に None を返す）。
    pub fn new(object_file: &object::File<'static>) -> Result<Self> {
        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let mut bases = BaseAddresses::default();
        if let Some(text) = object_file.section_by_name(".text") {
            bases = bases.set_text(text.address());
        }
        if let Some(got) = object_file.section_by_name(".got") {
            bases = bases.set_got(got.address());
        }

        let eh_frame = match object_file.section_by_name(".eh_frame") {
            Some(section) => {
                bases = bases.set_eh_frame(section.address());
                let data = section
                    .data()
                    .map_err(|e| anyhow::anyhow!("Failed to read .eh_frame: {}", e))?;
                let mut eh_frame = EhFrame::new(data, endian);
                eh_frame.set_address_size(if object_file.is_64() { 8 } else { 4 });
                Some(eh_frame)
            }
            None => {
                debug!(".eh_frame not found, CFI unwinding disabled for this file");
                None
            }
        };

        Ok(Self { eh_frame, bases })
    }

    /// `.eh_frame` を持つか
    pub fn is_empty(&self) -> bool {
        self.eh_frame.is_none()
    }

    /// PCにおけるフレーム規則を返す
    ///
    /// FDEがない、またはCFAが式で表されている場合は None です。
    pub fn rules_for(&self, pc: u64) -> Option<FrameRules> {
        let eh_frame = self.eh_frame.as_ref()?;

        let fde = match eh_frame.fde_for_address(&self.bases, pc, EhFrame::cie_from_offset) {
            Ok(fde) => fde,
            Err(e) => {
                trace!(pc = format_args!("0x{:x}", pc), error = %e, "no FDE");
                return None;
            }
        };

        let mut ctx = UnwindContext::new();
        let row = match fde.unwind_info_for_address(eh_frame, &self.bases, &mut ctx, pc) {
            Ok(row) => row,
            Err(e) => {
                debug!(pc = format_args!("0x{:x}", pc), error = %e, "failed to evaluate CFI row");
                return None;
            }
        };

        let (cfa_register, cfa_offset) = match row.cfa() {
            CfaRule::RegisterAndOffset { register, offset } => (register.0, *offset),
            CfaRule::Expression(_) => {
                trace!(pc = format_args!("0x{:x}", pc), "CFA expression is not supported");
                return None;
            }
        };

        let rules = row
            .registers()
            .filter_map(|(register, rule)| {
                let saved = match rule {
                    RegisterRule::Undefined => SavedRule::Undefined,
                    RegisterRule::SameValue => SavedRule::SameValue,
                    RegisterRule::Offset(n) => SavedRule::AtCfaOffset(*n),
                    RegisterRule::ValOffset(n) => SavedRule::CfaPlus(*n),
                    RegisterRule::Register(r) => SavedRule::InRegister(r.0),
                    _ => return None,
                };
                Some((register.0, saved))
            })
            .collect();

        Some(FrameRules {
            cfa_register,
            cfa_offset,
            rules,
            return_address_register: fde.cie().return_address_register().0,
        })
    }
}
