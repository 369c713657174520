//! DWARF型情報の抽出
//!
//! 全コンパイルユニットのDIEを一度だけ走査し、型テーブルと
//! グローバル変数・TLS変数の索引を構築します。
//! 型参照は `.debug_info` 内の絶対オフセットで `TypeId` に対応付けるため、
//! 定義より前に参照された型（自己参照する構造体など）も正しく結ばれます。

use crate::types::{BaseEncoding, Enumerator, Member, TypeDesc, TypeId, TypeKind, TypeTable};
use crate::variables::{VariableIndex, VariableInfo, VariableLocation};
use crate::{DwarfLoader, Result};
use gimli::Reader;
use std::collections::HashMap;
use tracing::{debug, warn};

/// 抽出結果
#[derive(Debug, Clone)]
pub struct DebugInfo {
    pub types: TypeTable,
    pub variables: VariableIndex,
}

impl DebugInfo {
    /// ローダーが読み込んだDWARFから抽出する
    pub fn load(loader: &DwarfLoader) -> Result<Self> {
        let pointer_size = if loader.arch_name() == "i386" { 4 } else { 8 };
        TypeInfoExtractor::new(loader.dwarf(), pointer_size).extract()
    }
}

/// 型情報抽出器
pub struct TypeInfoExtractor<'a, R: Reader<Offset = usize>> {
    dwarf: &'a gimli::Dwarf<R>,
    table: TypeTable,
    variables: VariableIndex,
    /// `.debug_info` 内オフセット -> TypeId
    ids: HashMap<usize, TypeId>,
}

impl<'a, R: Reader<Offset = usize>> TypeInfoExtractor<'a, R> {
    /// 新しい型情報抽出器を作成する
    pub fn new(dwarf: &'a gimli::Dwarf<R>, pointer_size: u64) -> Self {
        Self {
            dwarf,
            table: TypeTable::new(pointer_size),
            variables: VariableIndex::default(),
            ids: HashMap::new(),
        }
    }

    /// 全ユニットを走査して抽出する
    ///
    /// 壊れたユニットは警告を出して読み飛ばします。
    pub fn extract(mut self) -> Result<DebugInfo> {
        let mut units = self.dwarf.units();
        while let Some(header) = units.next()? {
            let unit = match self.dwarf.unit(header) {
                Ok(unit) => unit,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable compilation unit");
                    continue;
                }
            };
            if let Err(e) = self.extract_unit(&unit) {
                warn!(error = %e, "failed to extract compilation unit");
            }
        }

        debug!(
            types = self.table.len(),
            variables = self.variables.len(),
            "extracted debug info"
        );
        Ok(DebugInfo {
            types: self.table,
            variables: self.variables,
        })
    }

    fn extract_unit(&mut self, unit: &gimli::Unit<R>) -> Result<()> {
        let mut entries = unit.entries();
        let mut depth: isize = 0;
        // 祖先DIEのタグ（関数内の static 変数を除外するため）
        let mut scope: Vec<gimli::DwTag> = Vec::new();

        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            scope.truncate(depth.max(0) as usize);

            let in_function = scope.iter().any(|tag| {
                matches!(
                    *tag,
                    gimli::DW_TAG_subprogram | gimli::DW_TAG_lexical_block | gimli::DW_TAG_inlined_subroutine
                )
            });

            match entry.tag() {
                gimli::DW_TAG_variable if !in_function => self.extract_variable(unit, entry)?,
                tag => self.extract_type(unit, entry, tag)?,
            }

            scope.push(entry.tag());
        }
        Ok(())
    }

    /// 絶対オフセットに対応する TypeId（未出現なら予約する）
    fn type_id(&mut self, offset: usize) -> TypeId {
        *self.ids.entry(offset).or_insert_with(|| self.table.reserve())
    }

    /// DIE自身の TypeId
    fn own_id(&mut self, unit: &gimli::Unit<R>, offset: gimli::UnitOffset) -> Option<TypeId> {
        let global = offset.to_debug_info_offset(&unit.header)?;
        Some(self.type_id(global.0))
    }

    /// DW_AT_type が指す型の TypeId
    fn type_ref(
        &mut self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<TypeId>> {
        let global = match entry.attr_value(gimli::DW_AT_type)? {
            Some(gimli::AttributeValue::UnitRef(offset)) => offset.to_debug_info_offset(&unit.header),
            Some(gimli::AttributeValue::DebugInfoRef(offset)) => Some(offset),
            _ => None,
        };
        Ok(global.map(|g| self.type_id(g.0)))
    }

    fn extract_type(
        &mut self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
        tag: gimli::DwTag,
    ) -> Result<()> {
        let kind = match tag {
            gimli::DW_TAG_base_type => TypeKind::Base {
                encoding: base_encoding(entry)?,
            },
            gimli::DW_TAG_pointer_type
            | gimli::DW_TAG_reference_type
            | gimli::DW_TAG_rvalue_reference_type => TypeKind::Pointer {
                pointee: self.type_ref(unit, entry)?,
            },
            gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type => TypeKind::Struct {
                members: self.extract_members(unit, entry)?,
            },
            gimli::DW_TAG_union_type => TypeKind::Union {
                members: self.extract_members(unit, entry)?,
            },
            gimli::DW_TAG_enumeration_type => TypeKind::Enum {
                enumerators: self.extract_enumerators(unit, entry)?,
            },
            gimli::DW_TAG_typedef => TypeKind::Typedef {
                target: self.type_ref(unit, entry)?,
            },
            gimli::DW_TAG_const_type
            | gimli::DW_TAG_volatile_type
            | gimli::DW_TAG_restrict_type
            | gimli::DW_TAG_atomic_type => TypeKind::Qualified {
                target: self.type_ref(unit, entry)?,
            },
            gimli::DW_TAG_subroutine_type => TypeKind::Function,
            gimli::DW_TAG_array_type => return self.extract_array(unit, entry),
            _ => return Ok(()),
        };

        let Some(id) = self.own_id(unit, entry.offset()) else {
            return Ok(());
        };
        let mut desc = TypeDesc::new(
            self.name_of(unit, entry)?,
            udata_attr(entry, gimli::DW_AT_byte_size)?.unwrap_or(0),
            kind,
        );
        desc.declaration = flag_attr(entry, gimli::DW_AT_declaration)?;
        self.table.define(id, desc);
        Ok(())
    }

    /// 配列型を抽出する
    ///
    /// 多次元配列は `DW_TAG_subrange_type` ごとに入れ子の配列型にします。
    fn extract_array(
        &mut self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<()> {
        let Some(id) = self.own_id(unit, entry.offset()) else {
            return Ok(());
        };
        let Some(element) = self.type_ref(unit, entry)? else {
            self.table.define(id, TypeDesc::new(None, 0, TypeKind::Unknown));
            return Ok(());
        };

        let mut counts = Vec::new();
        let mut tree = unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let sub = child.entry();
            if sub.tag() != gimli::DW_TAG_subrange_type {
                continue;
            }
            let count = match udata_attr(sub, gimli::DW_AT_count)? {
                Some(count) => Some(count),
                None => udata_attr(sub, gimli::DW_AT_upper_bound)?.map(|upper| upper + 1),
            };
            counts.push(count);
        }

        let Some((outer, inner)) = counts.split_first() else {
            self.table.define(id, TypeDesc::new(None, 0, TypeKind::Array { element, count: None }));
            return Ok(());
        };

        let mut element = element;
        for count in inner.iter().rev() {
            element = self.table.add(TypeDesc::new(None, 0, TypeKind::Array { element, count: *count }));
        }
        self.table.define(id, TypeDesc::new(None, 0, TypeKind::Array { element, count: *outer }));
        Ok(())
    }

    /// 構造体・共用体のメンバーを抽出する
    fn extract_members(
        &mut self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        let mut tree = unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();

        while let Some(child) = children.next()? {
            let member = child.entry();
            if member.tag() != gimli::DW_TAG_member {
                continue;
            }
            let Some(ty) = self.type_ref(unit, member)? else {
                continue;
            };
            members.push(Member {
                name: self.name_of(unit, member)?.unwrap_or_default(),
                offset: member_offset(member)?.unwrap_or(0),
                ty,
            });
        }
        Ok(members)
    }

    /// 列挙子を抽出する
    fn extract_enumerators(
        &mut self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Vec<Enumerator>> {
        let mut enumerators = Vec::new();
        let mut tree = unit.entries_tree(Some(entry.offset()))?;
        let root = tree.root()?;
        let mut children = root.children();

        while let Some(child) = children.next()? {
            let e = child.entry();
            if e.tag() != gimli::DW_TAG_enumerator {
                continue;
            }
            let value = match e.attr_value(gimli::DW_AT_const_value)? {
                Some(gimli::AttributeValue::Sdata(v)) => v,
                Some(other) => match other.udata_value() {
                    Some(v) => v as i64,
                    None => continue,
                },
                None => continue,
            };
            if let Some(name) = self.name_of(unit, e)? {
                enumerators.push(Enumerator { name, value });
            }
        }
        Ok(enumerators)
    }

    /// 変数DIEを索引に登録する
    ///
    /// `extern` 宣言と定義が分かれている場合、定義側の `DW_AT_specification`
    /// から名前と型を補います。
    fn extract_variable(
        &mut self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<()> {
        let spec = match entry.attr_value(gimli::DW_AT_specification)? {
            Some(gimli::AttributeValue::UnitRef(offset)) => Some(unit.entry(offset)?),
            _ => None,
        };

        let name = match self.name_of(unit, entry)? {
            Some(name) => Some(name),
            None => match &spec {
                Some(decl) => self.name_of(unit, decl)?,
                None => None,
            },
        };
        let Some(name) = name else {
            return Ok(());
        };

        let ty = match self.type_ref(unit, entry)? {
            Some(ty) => Some(ty),
            None => match &spec {
                Some(decl) => self.type_ref(unit, decl)?,
                None => None,
            },
        };

        let location = match entry.attr_value(gimli::DW_AT_location)? {
            Some(gimli::AttributeValue::Exprloc(expr)) => self.decode_location(unit, expr)?,
            _ => VariableLocation::Unknown,
        };

        self.variables.insert(VariableInfo { name, ty, location });
        Ok(())
    }

    /// 静的アドレスまたはTLSオフセットを表すロケーション式を解釈する
    fn decode_location(&self, unit: &gimli::Unit<R>, expr: gimli::Expression<R>) -> Result<VariableLocation> {
        let mut ops = expr.operations(unit.encoding());
        let mut value = None;
        let mut location = VariableLocation::Unknown;

        while let Some(op) = ops.next()? {
            match op {
                gimli::Operation::Address { address } => {
                    value = Some(address);
                    location = VariableLocation::Static(address);
                }
                gimli::Operation::AddressIndex { index } => {
                    let address = self.dwarf.address(unit, index)?;
                    value = Some(address);
                    location = VariableLocation::Static(address);
                }
                gimli::Operation::UnsignedConstant { value: v } => {
                    value = Some(v);
                    location = VariableLocation::Unknown;
                }
                gimli::Operation::TLS => match value {
                    Some(offset) => location = VariableLocation::Tls(offset),
                    None => return Ok(VariableLocation::Unknown),
                },
                _ => return Ok(VariableLocation::Unknown),
            }
        }
        Ok(location)
    }

    /// DW_AT_name を文字列として取得する（.debug_str 参照も解決する）
    fn name_of(
        &self,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Option<String>> {
        let Some(attr) = entry.attr_value(gimli::DW_AT_name)? else {
            return Ok(None);
        };
        let name = self.dwarf.attr_string(unit, attr)?;
        Ok(Some(name.to_string_lossy()?.into_owned()))
    }
}

fn base_encoding<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> Result<BaseEncoding> {
    Ok(match entry.attr_value(gimli::DW_AT_encoding)? {
        Some(gimli::AttributeValue::Encoding(enc)) => match enc {
            gimli::DW_ATE_signed => BaseEncoding::Signed,
            gimli::DW_ATE_unsigned => BaseEncoding::Unsigned,
            gimli::DW_ATE_float => BaseEncoding::Float,
            gimli::DW_ATE_boolean => BaseEncoding::Boolean,
            gimli::DW_ATE_signed_char => BaseEncoding::SignedChar,
            gimli::DW_ATE_unsigned_char | gimli::DW_ATE_UTF => BaseEncoding::UnsignedChar,
            _ => BaseEncoding::Other,
        },
        _ => BaseEncoding::Other,
    })
}

fn udata_attr<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>, name: gimli::DwAt) -> Result<Option<u64>> {
    Ok(entry.attr_value(name)?.and_then(|attr| match attr {
        gimli::AttributeValue::Sdata(v) if v >= 0 => Some(v as u64),
        other => other.udata_value(),
    }))
}

fn flag_attr<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>, name: gimli::DwAt) -> Result<bool> {
    Ok(matches!(entry.attr_value(name)?, Some(gimli::AttributeValue::Flag(true))))
}

/// DW_AT_data_member_location（定数形式と DW_OP_plus_uconst 形式）
fn member_offset<R: Reader>(entry: &gimli::DebuggingInformationEntry<R>) -> Result<Option<u64>> {
    match entry.attr_value(gimli::DW_AT_data_member_location)? {
        Some(gimli::AttributeValue::Exprloc(expr)) => {
            let mut data = expr.0;
            let op = data.read_u8()?;
            if op == gimli::DW_OP_plus_uconst.0 {
                Ok(Some(data.read_uleb128()?))
            } else {
                Ok(None)
            }
        }
        Some(attr) => Ok(attr.udata_value()),
        None => Ok(None),
    }
}
