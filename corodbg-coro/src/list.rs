//! 侵入型循環リストの走査
//!
//! リンクフィールドは要素レコードに埋め込まれているため、リンクのアドレスから
//! フィールドオフセットを引いて要素のアドレスを復元します（container-of）。

use crate::error::{InspectError, Result};
use crate::remote::{field_offset, read_uint, RemoteValue};
use corodbg_dwarf::{MemoryReader, TypeId, TypeTable};
use tracing::trace;

/// `dump-list` の最大走査数
pub const DUMP_LIST_LIMIT: u64 = 100_000;

/// 走査の打ち切り条件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListBound {
    /// 要素数が既知（スケジューラの count フィールド）
    ///
    /// 要素数を正とし、ちょうどその回数だけ辿ったあとに head に戻らなければ不整合とみなします。
    Count(u64),
    /// head に戻るまで。`limit` 回を超えたら不整合
    UntilHead { limit: u64 },
}

/// リスト走査器
pub struct ListWalker<'t> {
    types: &'t TypeTable,
    element: TypeId,
    link_offset: u64,
    next_offset: u64,
}

impl<'t> ListWalker<'t> {
    /// 要素型とリンクフィールド名から作成する
    ///
    /// `next_field` はリンク型（`mm_list` など）の中の次ポインタの名前です。
    pub fn new(types: &'t TypeTable, element: TypeId, link_field: &str, next_field: &str) -> Result<Self> {
        let link_offset = field_offset(types, element, link_field)?;
        let link_ty = types
            .member(element, link_field)
            .map(|m| m.ty)
            .ok_or_else(|| InspectError::FieldNotFound {
                ty: types.display_name(element),
                field: link_field.to_string(),
            })?;
        let next_offset = field_offset(types, link_ty, next_field)?;

        Ok(Self {
            types,
            element,
            link_offset,
            next_offset,
        })
    }

    /// 要素レコード内のリンクフィールドのオフセット
    pub fn link_offset(&self) -> u64 {
        self.link_offset
    }

    /// リンクのアドレスから要素を復元する
    pub fn container_of(&self, link: u64) -> Result<RemoteValue<'t>> {
        let address = link.checked_sub(self.link_offset).ok_or_else(|| {
            InspectError::malformed(format!(
                "link 0x{:x} is below the link field offset {}",
                link, self.link_offset
            ))
        })?;
        Ok(RemoteValue::new(address, self.element, self.types))
    }

    fn next_of(&self, memory: &dyn MemoryReader, link: u64) -> Result<u64> {
        let address = link
            .checked_add(self.next_offset)
            .ok_or_else(|| InspectError::malformed(format!("link 0x{:x} is outside the address space", link)))?;
        read_uint(memory, address, self.types.pointer_size())
    }

    /// head（番兵）から要素を列挙する
    ///
    /// `Count(0)` の場合は head を読みません。
    pub fn walk(&self, memory: &dyn MemoryReader, head: u64, bound: ListBound) -> Result<Vec<RemoteValue<'t>>> {
        match bound {
            ListBound::Count(count) => self.walk_counted(memory, head, count),
            ListBound::UntilHead { limit } => self.walk_until_head(memory, head, limit),
        }
    }

    fn walk_counted(&self, memory: &dyn MemoryReader, head: u64, count: u64) -> Result<Vec<RemoteValue<'t>>> {
        let mut elements = Vec::new();
        if count == 0 {
            return Ok(elements);
        }

        let mut link = self.next_of(memory, head)?;
        for i in 0..count {
            if link == 0 {
                return Err(InspectError::malformed(format!(
                    "NULL link after {} of {} elements in list 0x{:x}",
                    i, count, head
                )));
            }
            if link == head {
                return Err(InspectError::malformed(format!(
                    "list 0x{:x} has {} elements but its count is {}",
                    head, i, count
                )));
            }
            trace!(index = i, link = format_args!("0x{:x}", link), "list element");
            elements.push(self.container_of(link)?);
            link = self.next_of(memory, link)?;
        }

        if link != head {
            return Err(InspectError::malformed(format!(
                "list 0x{:x} does not close after its count of {} elements",
                head, count
            )));
        }
        Ok(elements)
    }

    fn walk_until_head(&self, memory: &dyn MemoryReader, head: u64, limit: u64) -> Result<Vec<RemoteValue<'t>>> {
        let mut elements = Vec::new();
        let mut link = self.next_of(memory, head)?;

        while link != head {
            if link == 0 {
                return Err(InspectError::malformed(format!(
                    "NULL link after {} elements in list 0x{:x}",
                    elements.len(),
                    head
                )));
            }
            if elements.len() as u64 >= limit {
                return Err(InspectError::malformed(format!(
                    "list 0x{:x} did not return to its head within {} elements",
                    head, limit
                )));
            }
            elements.push(self.container_of(link)?);
            link = self.next_of(memory, link)?;
        }
        Ok(elements)
    }
}
