//! 型テーブル
//!
//! DWARFから抽出した型を、インデックス（`TypeId`）で相互参照する表として保持します。
//! 自己参照する構造体（連結リストのノードなど）も循環なしで表現できます。

use std::collections::HashMap;
use std::fmt::Write as _;

/// 型テーブル内の型ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(usize);

/// 基本型のエンコーディング
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseEncoding {
    Signed,
    Unsigned,
    Float,
    Boolean,
    SignedChar,
    UnsignedChar,
    Other,
}

/// 構造体・共用体のメンバー
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    /// 先頭からのバイトオフセット
    pub offset: u64,
    pub ty: TypeId,
}

/// 列挙子
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumerator {
    pub name: String,
    pub value: i64,
}

/// 型の種類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    Base { encoding: BaseEncoding },
    /// `void *` の場合 pointee は None
    Pointer { pointee: Option<TypeId> },
    Struct { members: Vec<Member> },
    Union { members: Vec<Member> },
    Enum { enumerators: Vec<Enumerator> },
    Array { element: TypeId, count: Option<u64> },
    Typedef { target: Option<TypeId> },
    /// const / volatile / restrict
    Qualified { target: Option<TypeId> },
    Function,
    Unknown,
}

/// 型の記述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDesc {
    pub name: Option<String>,
    /// バイトサイズ（配列・typedef・修飾型は 0 のことがある）
    pub size: u64,
    /// 前方宣言のみ（DW_AT_declaration）
    pub declaration: bool,
    pub kind: TypeKind,
}

impl TypeDesc {
    pub fn new(name: Option<String>, size: u64, kind: TypeKind) -> Self {
        Self {
            name,
            size,
            declaration: false,
            kind,
        }
    }
}

/// 型テーブル
#[derive(Debug, Clone)]
pub struct TypeTable {
    types: Vec<TypeDesc>,
    by_name: HashMap<String, TypeId>,
    pointer_size: u64,
}

/// typedef・修飾型を辿る最大段数（壊れたDWARFでの無限ループ防止）
const MAX_ALIAS_DEPTH: usize = 32;

impl TypeTable {
    /// 空の型テーブルを作成する
    pub fn new(pointer_size: u64) -> Self {
        Self {
            types: Vec::new(),
            by_name: HashMap::new(),
            pointer_size,
        }
    }

    /// ポインタのバイトサイズ
    pub fn pointer_size(&self) -> u64 {
        self.pointer_size
    }

    /// 型の数
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// 型を追加する
    pub fn add(&mut self, desc: TypeDesc) -> TypeId {
        let id = TypeId(self.types.len());
        self.types.push(desc);
        self.index_name(id);
        id
    }

    /// 中身が未定の型スロットを確保する（後で `define` する）
    pub fn reserve(&mut self) -> TypeId {
        let id = TypeId(self.types.len());
        self.types.push(TypeDesc::new(None, 0, TypeKind::Unknown));
        id
    }

    /// 確保済みスロットに型を定義する
    pub fn define(&mut self, id: TypeId, desc: TypeDesc) {
        self.types[id.0] = desc;
        self.index_name(id);
    }

    /// 名前索引を更新する
    ///
    /// 同名の型が複数ある場合は、前方宣言より完全な定義を優先します。
    fn index_name(&mut self, id: TypeId) {
        let desc = &self.types[id.0];
        let Some(name) = desc.name.clone() else {
            return;
        };
        if matches!(desc.kind, TypeKind::Pointer { .. } | TypeKind::Array { .. } | TypeKind::Qualified { .. } | TypeKind::Function) {
            return;
        }

        let replace = match self.by_name.get(&name) {
            None => true,
            Some(existing) => {
                let old = &self.types[existing.0];
                (old.declaration && !desc.declaration) || (old.size == 0 && desc.size > 0)
            }
        };
        if replace {
            self.by_name.insert(name, id);
        }
    }

    /// 型を取得する
    pub fn get(&self, id: TypeId) -> &TypeDesc {
        &self.types[id.0]
    }

    /// 名前から型を検索する
    ///
    /// `struct ` / `union ` / `enum ` の接頭辞は無視します。
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        let name = name.trim();
        let bare = ["struct ", "union ", "enum "]
            .iter()
            .find_map(|prefix| name.strip_prefix(prefix))
            .unwrap_or(name)
            .trim();
        self.by_name.get(bare).copied()
    }

    /// typedef と修飾型を取り除いた実体の型を返す
    ///
    /// 前方宣言だけの構造体は、同名の完全な定義があればそちらに置き換えます。
    pub fn resolve(&self, mut id: TypeId) -> TypeId {
        for _ in 0..MAX_ALIAS_DEPTH {
            let desc = self.get(id);
            match &desc.kind {
                TypeKind::Typedef { target: Some(t) } | TypeKind::Qualified { target: Some(t) } => {
                    id = *t
                }
                _ if desc.declaration => {
                    match desc.name.as_ref().and_then(|n| self.by_name.get(n)) {
                        Some(def) if *def != id && !self.get(*def).declaration => id = *def,
                        _ => break,
                    }
                }
                _ => break,
            }
        }
        id
    }

    /// 構造体・共用体のメンバー一覧
    pub fn members(&self, id: TypeId) -> Option<&[Member]> {
        match &self.get(self.resolve(id)).kind {
            TypeKind::Struct { members } | TypeKind::Union { members } => Some(members),
            _ => None,
        }
    }

    /// 名前でメンバーを検索する
    pub fn member(&self, id: TypeId, name: &str) -> Option<&Member> {
        self.members(id)?.iter().find(|m| m.name == name)
    }

    /// フィールドのバイトオフセットを返す
    pub fn field_offset(&self, id: TypeId, name: &str) -> Option<u64> {
        self.member(id, name).map(|m| m.offset)
    }

    /// ポインタ型なら指し先の型を返す（`void *` は Ok(None)）
    pub fn pointee(&self, id: TypeId) -> Option<Option<TypeId>> {
        match &self.get(self.resolve(id)).kind {
            TypeKind::Pointer { pointee } => Some(*pointee),
            _ => None,
        }
    }

    /// 型のバイトサイズ
    pub fn size_of(&self, id: TypeId) -> u64 {
        let resolved = self.resolve(id);
        let desc = self.get(resolved);
        match &desc.kind {
            TypeKind::Array { element, count } => self.size_of(*element) * count.unwrap_or(0),
            TypeKind::Pointer { .. } if desc.size == 0 => self.pointer_size,
            _ => desc.size,
        }
    }

    /// 列挙子名を値から引く
    pub fn enumerator_name(&self, id: TypeId, value: i64) -> Option<&str> {
        match &self.get(self.resolve(id)).kind {
            TypeKind::Enum { enumerators } => enumerators
                .iter()
                .find(|e| e.value == value)
                .map(|e| e.name.as_str()),
            _ => None,
        }
    }

    /// C風の型名を返す（"struct mm_coroutine", "char *", "char [16]" など）
    pub fn display_name(&self, id: TypeId) -> String {
        let mut out = String::new();
        self.write_name(id, &mut out, 0);
        out
    }

    fn write_name(&self, id: TypeId, out: &mut String, depth: usize) {
        if depth > MAX_ALIAS_DEPTH {
            out.push_str("...");
            return;
        }
        let desc = self.get(id);
        let name = desc.name.as_deref();
        match &desc.kind {
            TypeKind::Struct { .. } => {
                let _ = write!(out, "struct {}", name.unwrap_or("<anonymous>"));
            }
            TypeKind::Union { .. } => {
                let _ = write!(out, "union {}", name.unwrap_or("<anonymous>"));
            }
            TypeKind::Enum { .. } => {
                let _ = write!(out, "enum {}", name.unwrap_or("<anonymous>"));
            }
            TypeKind::Pointer { pointee } => {
                match pointee {
                    Some(p) => self.write_name(*p, out, depth + 1),
                    None => out.push_str("void"),
                }
                out.push_str(" *");
            }
            TypeKind::Array { element, count } => {
                self.write_name(*element, out, depth + 1);
                match count {
                    Some(n) => {
                        let _ = write!(out, " [{}]", n);
                    }
                    None => out.push_str(" []"),
                }
            }
            TypeKind::Qualified { target } => match target {
                Some(t) => self.write_name(*t, out, depth + 1),
                None => out.push_str("void"),
            },
            TypeKind::Function => out.push_str(name.unwrap_or("<function>")),
            TypeKind::Base { .. } | TypeKind::Typedef { .. } | TypeKind::Unknown => {
                out.push_str(name.unwrap_or("<unknown>"))
            }
        }
    }

    // --- 手組み用のヘルパー（テストや合成ターゲットで使用）---

    /// 基本型を追加する
    pub fn add_base(&mut self, name: &str, size: u64, encoding: BaseEncoding) -> TypeId {
        self.add(TypeDesc::new(Some(name.to_string()), size, TypeKind::Base { encoding }))
    }

    /// ポインタ型を追加する
    pub fn add_pointer(&mut self, pointee: Option<TypeId>) -> TypeId {
        let size = self.pointer_size;
        self.add(TypeDesc::new(None, size, TypeKind::Pointer { pointee }))
    }

    /// 配列型を追加する
    pub fn add_array(&mut self, element: TypeId, count: u64) -> TypeId {
        self.add(TypeDesc::new(None, 0, TypeKind::Array { element, count: Some(count) }))
    }

    /// typedef を追加する
    pub fn add_typedef(&mut self, name: &str, target: TypeId) -> TypeId {
        self.add(TypeDesc::new(Some(name.to_string()), 0, TypeKind::Typedef { target: Some(target) }))
    }

    /// 列挙型を追加する
    pub fn add_enum(&mut self, name: &str, size: u64, enumerators: &[(&str, i64)]) -> TypeId {
        let enumerators = enumerators
            .iter()
            .map(|(n, v)| Enumerator {
                name: n.to_string(),
                value: *v,
            })
            .collect();
        self.add(TypeDesc::new(Some(name.to_string()), size, TypeKind::Enum { enumerators }))
    }

    /// 構造体を前方宣言する（自己参照するメンバーを持つ構造体用）
    pub fn declare_struct(&mut self, name: &str) -> TypeId {
        let mut desc = TypeDesc::new(Some(name.to_string()), 0, TypeKind::Struct { members: Vec::new() });
        desc.declaration = true;
        self.add(desc)
    }

    /// 構造体を定義する（`declare_struct` で得たIDを渡す）
    pub fn define_struct(&mut self, id: TypeId, size: u64, members: &[(&str, u64, TypeId)]) {
        let name = self.get(id).name.clone();
        let members = members
            .iter()
            .map(|(n, offset, ty)| Member {
                name: n.to_string(),
                offset: *offset,
                ty: *ty,
            })
            .collect();
        self.define(id, TypeDesc::new(name, size, TypeKind::Struct { members }));
    }

    /// 構造体を追加する
    pub fn add_struct(&mut self, name: &str, size: u64, members: &[(&str, u64, TypeId)]) -> TypeId {
        let id = self.declare_struct(name);
        self.define_struct(id, size, members);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_table() -> (TypeTable, TypeId, TypeId) {
        let mut table = TypeTable::new(8);
        let list = table.declare_struct("mm_list");
        let list_ptr = table.add_pointer(Some(list));
        table.define_struct(list, 16, &[("next", 0, list_ptr), ("prev", 8, list_ptr)]);
        let u64_ty = table.add_base("uint64_t", 8, BaseEncoding::Unsigned);
        let coro = table.add_struct("mm_coroutine", 32, &[("id", 0, u64_ty), ("link", 16, list)]);
        (table, list, coro)
    }

    #[test]
    fn test_lookup_with_prefix() {
        let (table, list, coro) = list_table();
        assert_eq!(table.lookup("struct mm_coroutine"), Some(coro));
        assert_eq!(table.lookup("mm_coroutine"), Some(coro));
        assert_eq!(table.lookup("  struct   mm_list "), Some(list));
        assert_eq!(table.lookup("mm_missing"), None);
    }

    #[test]
    fn test_field_offset_through_typedef() {
        let (mut table, _, coro) = list_table();
        let alias = table.add_typedef("mm_coroutine_t", coro);
        assert_eq!(table.field_offset(alias, "link"), Some(16));
        assert_eq!(table.field_offset(alias, "id"), Some(0));
        assert_eq!(table.field_offset(alias, "nope"), None);
    }

    #[test]
    fn test_self_referential_names() {
        let (table, list, _) = list_table();
        let next = table.member(list, "next").unwrap();
        assert_eq!(table.display_name(next.ty), "struct mm_list *");
        assert_eq!(table.pointee(next.ty), Some(Some(list)));
        assert_eq!(table.size_of(next.ty), 8);
    }

    #[test]
    fn test_definition_replaces_declaration() {
        let mut table = TypeTable::new(8);
        let decl = table.declare_struct("machine");
        assert_eq!(table.lookup("machine"), Some(decl));
        let int = table.add_base("int", 4, BaseEncoding::Signed);
        let def = table.add_struct("machine", 4, &[("online", 0, int)]);
        assert_eq!(table.lookup("machine"), Some(def));
        // 宣言側のIDからも定義のメンバーが見える
        assert_eq!(table.resolve(decl), def);
        assert_eq!(table.field_offset(decl, "online"), Some(0));
    }

    #[test]
    fn test_array_size_and_name() {
        let mut table = TypeTable::new(8);
        let ch = table.add_base("char", 1, BaseEncoding::SignedChar);
        let arr = table.add_array(ch, 16);
        assert_eq!(table.size_of(arr), 16);
        assert_eq!(table.display_name(arr), "char [16]");
        let void_ptr = table.add_pointer(None);
        assert_eq!(table.display_name(void_ptr), "void *");
    }

    #[test]
    fn test_enumerator_name() {
        let mut table = TypeTable::new(8);
        let state = table.add_enum("mm_coroutinestate_t", 4, &[("MM_CNEW", 0), ("MM_CREADY", 1)]);
        assert_eq!(table.enumerator_name(state, 1), Some("MM_CREADY"));
        assert_eq!(table.enumerator_name(state, 7), None);
    }
}
