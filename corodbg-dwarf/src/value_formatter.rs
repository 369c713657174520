//! 変数値のフォーマット
//!
//! 型テーブルに基づいて、ターゲットのメモリ上の値を人間が読みやすい形式
//! （gdb の `print` に近い形式）でフォーマットします。

use crate::types::{BaseEncoding, Member, TypeId, TypeKind, TypeTable};
use crate::Result;
use std::fmt::Write as _;

/// メモリ読み取りトレイト
///
/// デバッガのメモリインターフェースを抽象化します。
pub trait MemoryReader {
    fn read_u8(&self, addr: usize) -> Result<u8>;
    fn read_u16(&self, addr: usize) -> Result<u16>;
    fn read_u32(&self, addr: usize) -> Result<u32>;
    fn read_u64(&self, addr: usize) -> Result<u64>;
    fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>>;
}

/// フォーマット制御オプション
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// インデントレベル
    pub indent: usize,
    /// 最大再帰深さ
    pub max_depth: usize,
    /// 配列要素の表示上限
    pub max_elements: usize,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            indent: 0,
            max_depth: 10,
            max_elements: 200,
        }
    }
}

impl FormatOptions {
    fn nested(&self) -> Self {
        Self {
            indent: self.indent + 2,
            ..self.clone()
        }
    }
}

/// アドレスをシンボル名に変換する関数
pub type Symbolizer<'a> = &'a dyn Fn(u64) -> Option<String>;

/// 値フォーマッター
///
/// 値全体を一度に読み取り、バイト列から再帰的にフォーマットします。
pub struct ValueFormatter<'a> {
    memory: &'a dyn MemoryReader,
    types: &'a TypeTable,
    symbolizer: Option<Symbolizer<'a>>,
}

impl<'a> ValueFormatter<'a> {
    /// 新しいフォーマッターを作成する
    pub fn new(memory: &'a dyn MemoryReader, types: &'a TypeTable) -> Self {
        Self {
            memory,
            types,
            symbolizer: None,
        }
    }

    /// 関数ポインタを `<symbol+off>` 付きで表示する
    pub fn with_symbolizer(mut self, symbolizer: Symbolizer<'a>) -> Self {
        self.symbolizer = Some(symbolizer);
        self
    }

    /// アドレスにある値をフォーマットする
    pub fn format(&self, address: u64, ty: TypeId, options: &FormatOptions) -> Result<String> {
        let size = self.types.size_of(ty);
        if size == 0 {
            return Ok(format!("<incomplete type {}>", self.types.display_name(ty)));
        }
        let bytes = self.memory.read(address as usize, size as usize)?;
        Ok(self.format_bytes(ty, &bytes, options))
    }

    /// 読み取り済みのバイト列をフォーマットする
    pub fn format_bytes(&self, ty: TypeId, bytes: &[u8], options: &FormatOptions) -> String {
        if options.indent / 2 >= options.max_depth {
            return "<max depth reached>".to_string();
        }

        let resolved = self.types.resolve(ty);
        let desc = self.types.get(resolved);
        match &desc.kind {
            TypeKind::Base { encoding } => format_base(*encoding, bytes),
            TypeKind::Enum { .. } => {
                let value = read_signed(bytes);
                match self.types.enumerator_name(resolved, value) {
                    Some(name) => name.to_string(),
                    None => value.to_string(),
                }
            }
            TypeKind::Pointer { pointee } => {
                let value = read_unsigned(bytes);
                self.format_pointer(value, *pointee)
            }
            TypeKind::Struct { members } | TypeKind::Union { members } => {
                self.format_members(members, bytes, options)
            }
            TypeKind::Array { element, count } => {
                self.format_array(*element, count.unwrap_or(0), bytes, options)
            }
            TypeKind::Function => "<function>".to_string(),
            TypeKind::Typedef { .. } | TypeKind::Qualified { .. } | TypeKind::Unknown => {
                format!("<unknown type {}>", self.types.display_name(ty))
            }
        }
    }

    fn format_pointer(&self, value: u64, pointee: Option<TypeId>) -> String {
        if value == 0 {
            return "0x0".to_string();
        }
        let is_function = pointee
            .map(|p| matches!(self.types.get(self.types.resolve(p)).kind, TypeKind::Function))
            .unwrap_or(false);
        match self.symbolizer {
            Some(symbolize) if is_function => match symbolize(value) {
                Some(symbol) => format!("0x{:x} <{}>", value, symbol),
                None => format!("0x{:x}", value),
            },
            _ => format!("0x{:x}", value),
        }
    }

    fn format_members(&self, members: &[Member], bytes: &[u8], options: &FormatOptions) -> String {
        if members.is_empty() {
            return "{}".to_string();
        }

        let inner = options.nested();
        let pad = " ".repeat(inner.indent);
        let mut out = String::from("{\n");
        for (i, member) in members.iter().enumerate() {
            let start = member.offset as usize;
            let end = start + self.types.size_of(member.ty) as usize;
            let value = match bytes.get(start..end) {
                Some(slice) => self.format_bytes(member.ty, slice, &inner),
                None => "<out of bounds>".to_string(),
            };
            let sep = if i + 1 < members.len() { "," } else { "" };
            let _ = writeln!(out, "{}{} = {}{}", pad, member.name, value, sep);
        }
        out.push_str(&" ".repeat(options.indent));
        out.push('}');
        out
    }

    fn format_array(&self, element: TypeId, count: u64, bytes: &[u8], options: &FormatOptions) -> String {
        let elem_size = self.types.size_of(element) as usize;
        if elem_size == 0 {
            return "[]".to_string();
        }

        // char 配列は文字列として表示する
        if elem_size == 1 {
            if let TypeKind::Base {
                encoding: BaseEncoding::SignedChar | BaseEncoding::UnsignedChar,
            } = self.types.get(self.types.resolve(element)).kind
            {
                return format_c_string(bytes);
            }
        }

        let shown = (count as usize).min(options.max_elements);
        let mut parts = Vec::with_capacity(shown);
        for i in 0..shown {
            let start = i * elem_size;
            match bytes.get(start..start + elem_size) {
                Some(slice) => parts.push(self.format_bytes(element, slice, options)),
                None => break,
            }
        }
        if (count as usize) > shown {
            parts.push("...".to_string());
        }
        format!("[{}]", parts.join(", "))
    }
}

fn read_unsigned(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

fn read_signed(bytes: &[u8]) -> i64 {
    let value = read_unsigned(bytes);
    match bytes.len() {
        1 => value as u8 as i8 as i64,
        2 => value as u16 as i16 as i64,
        4 => value as u32 as i32 as i64,
        _ => value as i64,
    }
}

fn format_base(encoding: BaseEncoding, bytes: &[u8]) -> String {
    match encoding {
        BaseEncoding::Signed => read_signed(bytes).to_string(),
        BaseEncoding::Unsigned | BaseEncoding::Other => read_unsigned(bytes).to_string(),
        BaseEncoding::Boolean => (read_unsigned(bytes) != 0).to_string(),
        BaseEncoding::Float => match bytes.len() {
            4 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string(),
            8 => f64::from_le_bytes(read_unsigned(bytes).to_le_bytes()).to_string(),
            _ => format!("<float{}>", bytes.len() * 8),
        },
        BaseEncoding::SignedChar | BaseEncoding::UnsignedChar => {
            let value = if encoding == BaseEncoding::SignedChar {
                read_signed(bytes)
            } else {
                read_unsigned(bytes) as i64
            };
            match u8::try_from(value) {
                Ok(b) if b.is_ascii_graphic() || b == b' ' => format!("{} '{}'", value, b as char),
                _ => value.to_string(),
            }
        }
    }
}

/// NUL終端までを C 文字列リテラルとして表示する
fn format_c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    let mut out = String::from("\"");
    for b in &bytes[..end] {
        match *b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b if b.is_ascii_graphic() || b == b' ' => out.push(b as char),
            b => {
                let _ = write!(out, "\\{:03o}", b);
            }
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockMemory {
        data: HashMap<usize, u8>,
    }

    impl MockMemory {
        fn new() -> Self {
            Self { data: HashMap::new() }
        }

        fn write(&mut self, addr: usize, bytes: &[u8]) {
            for (i, b) in bytes.iter().enumerate() {
                self.data.insert(addr + i, *b);
            }
        }
    }

    impl MemoryReader for MockMemory {
        fn read_u8(&self, addr: usize) -> Result<u8> {
            self.data
                .get(&addr)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("unmapped 0x{:x}", addr))
        }

        fn read_u16(&self, addr: usize) -> Result<u16> {
            let b = self.read(addr, 2)?;
            Ok(u16::from_le_bytes([b[0], b[1]]))
        }

        fn read_u32(&self, addr: usize) -> Result<u32> {
            let b = self.read(addr, 4)?;
            Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        }

        fn read_u64(&self, addr: usize) -> Result<u64> {
            Ok(read_unsigned(&self.read(addr, 8)?))
        }

        fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
            (0..size).map(|i| self.read_u8(addr + i)).collect()
        }
    }

    #[test]
    fn test_format_struct_with_enum_and_name() {
        let mut table = TypeTable::new(8);
        let u64_ty = table.add_base("uint64_t", 8, BaseEncoding::Unsigned);
        let int_ty = table.add_base("int", 4, BaseEncoding::Signed);
        let state = table.add_enum("mm_coroutinestate_t", 4, &[("MM_CNEW", 0), ("MM_CREADY", 1)]);
        let ch = table.add_base("char", 1, BaseEncoding::SignedChar);
        let name = table.add_array(ch, 8);
        let coro = table.add_struct(
            "coro",
            24,
            &[("id", 0, u64_ty), ("state", 8, state), ("errno_", 12, int_ty), ("name", 16, name)],
        );

        let mut mem = MockMemory::new();
        mem.write(0x1000, &7u64.to_le_bytes());
        mem.write(0x1008, &1u32.to_le_bytes());
        mem.write(0x100c, &(-2i32).to_le_bytes());
        mem.write(0x1010, b"w\"1\0\0\0\0\0");

        let formatter = ValueFormatter::new(&mem, &table);
        let out = formatter.format(0x1000, coro, &FormatOptions::default()).unwrap();
        assert_eq!(
            out,
            "{\n  id = 7,\n  state = MM_CREADY,\n  errno_ = -2,\n  name = \"w\\\"1\"\n}"
        );
    }

    #[test]
    fn test_format_function_pointer_symbolized() {
        let mut table = TypeTable::new(8);
        let func = table.add(crate::TypeDesc::new(None, 0, TypeKind::Function));
        let fptr = table.add_pointer(Some(func));

        let mut mem = MockMemory::new();
        mem.write(0x2000, &0x401000u64.to_le_bytes());

        let symbolize = |addr: u64| (addr == 0x401000).then(|| "worker".to_string());
        let formatter = ValueFormatter::new(&mem, &table).with_symbolizer(&symbolize);
        assert_eq!(
            formatter.format(0x2000, fptr, &FormatOptions::default()).unwrap(),
            "0x401000 <worker>"
        );
    }

    #[test]
    fn test_format_nested_and_arrays() {
        let mut table = TypeTable::new(8);
        let list = table.declare_struct("mm_list");
        let list_ptr = table.add_pointer(Some(list));
        table.define_struct(list, 16, &[("next", 0, list_ptr), ("prev", 8, list_ptr)]);
        let u16_ty = table.add_base("unsigned short", 2, BaseEncoding::Unsigned);
        let arr = table.add_array(u16_ty, 3);
        let outer = table.add_struct("outer", 24, &[("link", 0, list), ("vals", 16, arr)]);

        let mut mem = MockMemory::new();
        mem.write(0x3000, &0x3000u64.to_le_bytes());
        mem.write(0x3008, &0u64.to_le_bytes());
        mem.write(0x3010, &[1, 0, 2, 0, 3, 0, 0, 0]);

        let formatter = ValueFormatter::new(&mem, &table);
        let out = formatter.format(0x3000, outer, &FormatOptions::default()).unwrap();
        assert_eq!(
            out,
            "{\n  link = {\n    next = 0x3000,\n    prev = 0x0\n  },\n  vals = [1, 2, 3]\n}"
        );
    }

    #[test]
    fn test_unreadable_memory_is_error() {
        let mut table = TypeTable::new(8);
        let int_ty = table.add_base("int", 4, BaseEncoding::Signed);
        let mem = MockMemory::new();
        let formatter = ValueFormatter::new(&mem, &table);
        assert!(formatter.format(0x10, int_ty, &FormatOptions::default()).is_err());
    }
}
