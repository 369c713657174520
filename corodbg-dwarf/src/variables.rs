//! グローバル変数・スレッドローカル変数の索引

use crate::TypeId;
use std::collections::HashMap;

/// 変数のロケーション
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableLocation {
    /// 静的アドレス（DW_OP_addr、ロードバイアス適用前）
    Static(u64),
    /// TLSブロック内のオフセット（DW_OP_form_tls_address / DW_OP_GNU_push_tls_address）
    Tls(u64),
    /// 宣言のみ、または解釈できない式
    Unknown,
}

/// 変数情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub name: String,
    pub ty: Option<TypeId>,
    pub location: VariableLocation,
}

/// 名前で引ける変数索引
///
/// 同名の変数が複数のユニットにある場合（`extern` 宣言と定義など）、
/// ロケーションを持つものを優先して返します。
#[derive(Debug, Clone, Default)]
pub struct VariableIndex {
    by_name: HashMap<String, Vec<VariableInfo>>,
}

impl VariableIndex {
    /// 変数を登録する
    pub fn insert(&mut self, info: VariableInfo) {
        self.by_name.entry(info.name.clone()).or_default().push(info);
    }

    /// 名前で検索する
    pub fn lookup(&self, name: &str) -> Option<&VariableInfo> {
        let candidates = self.by_name.get(name)?;
        candidates
            .iter()
            .find(|v| v.location != VariableLocation::Unknown && v.ty.is_some())
            .or_else(|| candidates.iter().find(|v| v.location != VariableLocation::Unknown))
            .or_else(|| candidates.first())
    }

    /// 登録された変数名の数
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
