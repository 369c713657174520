//! 型付きリモート参照
//!
//! ターゲットのアドレスは別アドレス空間のものなので、生ポインタとしては扱わず、
//! （アドレス, 型）の組として持ち回ります。読み取りは必要になった時点で行います。

use crate::error::{InspectError, Result};
use corodbg_dwarf::{MemoryReader, TypeId, TypeKind, TypeTable};

/// 名前から型を引く
pub fn lookup_type(types: &TypeTable, name: &str) -> Result<TypeId> {
    types
        .lookup(name)
        .ok_or_else(|| InspectError::TypeNotFound(name.trim().to_string()))
}

/// フィールドのバイトオフセット
pub fn field_offset(types: &TypeTable, ty: TypeId, field: &str) -> Result<u64> {
    if types.members(ty).is_none() {
        return Err(InspectError::NotAggregate(types.display_name(ty)));
    }
    types
        .field_offset(ty, field)
        .ok_or_else(|| InspectError::FieldNotFound {
            ty: types.display_name(ty),
            field: field.to_string(),
        })
}

/// 符号なし整数を読む（1/2/4/8 バイト、リトルエンディアン）
pub(crate) fn read_uint(memory: &dyn MemoryReader, address: u64, size: u64) -> Result<u64> {
    let value = match size {
        1 => memory.read_u8(address as usize).map(u64::from),
        2 => memory.read_u16(address as usize).map(u64::from),
        4 => memory.read_u32(address as usize).map(u64::from),
        8 => memory.read_u64(address as usize),
        other => {
            return Err(InspectError::malformed(format!(
                "cannot read a {}-byte scalar at 0x{:x}",
                other, address
            )))
        }
    };
    value.map_err(|e| InspectError::memory(address, e))
}

/// ターゲット上の型付きの値
#[derive(Clone, Copy)]
pub struct RemoteValue<'t> {
    address: u64,
    ty: TypeId,
    types: &'t TypeTable,
}

impl std::fmt::Debug for RemoteValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) 0x{:x}", self.types.display_name(self.ty), self.address)
    }
}

impl<'t> RemoteValue<'t> {
    pub fn new(address: u64, ty: TypeId, types: &'t TypeTable) -> Self {
        Self { address, ty, types }
    }

    /// 値の先頭アドレス
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn ty(&self) -> TypeId {
        self.ty
    }

    pub fn types(&self) -> &'t TypeTable {
        self.types
    }

    pub fn type_name(&self) -> String {
        self.types.display_name(self.ty)
    }

    /// 値のバイトサイズ
    pub fn size(&self) -> u64 {
        self.types.size_of(self.ty)
    }

    /// 同じアドレスを別の型として解釈する
    pub fn cast(&self, ty: TypeId) -> Self {
        Self { ty, ..*self }
    }

    /// 構造体・共用体のフィールド
    pub fn field(&self, name: &str) -> Result<Self> {
        if self.types.members(self.ty).is_none() {
            return Err(InspectError::NotAggregate(self.type_name()));
        }
        let member = self
            .types
            .member(self.ty, name)
            .ok_or_else(|| InspectError::FieldNotFound {
                ty: self.type_name(),
                field: name.to_string(),
            })?;
        let address = self.address.checked_add(member.offset).ok_or_else(|| {
            InspectError::malformed(format!(
                "field {} of {} at 0x{:x} is outside the address space",
                name,
                self.type_name(),
                self.address
            ))
        })?;
        Ok(Self::new(address, member.ty, self.types))
    }

    /// フィールドがあれば返す（省略可能なフィールド用）
    pub fn try_field(&self, name: &str) -> Option<Self> {
        self.field(name).ok()
    }

    /// ポインタ値を読む
    pub fn read_pointer(&self, memory: &dyn MemoryReader) -> Result<u64> {
        if self.types.pointee(self.ty).is_none() {
            return Err(InspectError::NotAPointer(self.type_name()));
        }
        read_uint(memory, self.address, self.types.pointer_size())
    }

    /// ポインタを辿る（NULL なら None）
    pub fn deref(&self, memory: &dyn MemoryReader) -> Result<Option<Self>> {
        let pointee = match self.types.pointee(self.ty) {
            Some(Some(pointee)) => pointee,
            Some(None) => {
                return Err(InspectError::NotAPointer(format!(
                    "{} (untyped)",
                    self.type_name()
                )))
            }
            None => return Err(InspectError::NotAPointer(self.type_name())),
        };
        match self.read_pointer(memory)? {
            0 => Ok(None),
            target => Ok(Some(Self::new(target, pointee, self.types))),
        }
    }

    /// 整数・列挙型・ポインタを符号なし整数として読む
    pub fn read_unsigned(&self, memory: &dyn MemoryReader) -> Result<u64> {
        read_uint(memory, self.address, self.size())
    }

    /// 整数・列挙型を符号付き整数として読む
    pub fn read_signed(&self, memory: &dyn MemoryReader) -> Result<i64> {
        let size = self.size();
        let raw = read_uint(memory, self.address, size)?;
        Ok(match size {
            1 => raw as u8 as i8 as i64,
            2 => raw as u16 as i16 as i64,
            4 => raw as u32 as i32 as i64,
            _ => raw as i64,
        })
    }

    /// 列挙型の値を列挙子名で返す（該当なしは None）
    pub fn enumerator_name(&self, value: i64) -> Option<&'t str> {
        self.types.enumerator_name(self.ty, value)
    }

    /// 固定長 char 配列を NUL 終端の文字列として読む
    pub fn read_c_string(&self, memory: &dyn MemoryReader) -> Result<String> {
        let resolved = self.types.resolve(self.ty);
        let len = match &self.types.get(resolved).kind {
            TypeKind::Array { .. } => self.size(),
            _ => return Err(InspectError::NotAggregate(self.type_name())),
        };
        let bytes = memory
            .read(self.address as usize, len as usize)
            .map_err(|e| InspectError::memory(self.address, e))?;
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}
