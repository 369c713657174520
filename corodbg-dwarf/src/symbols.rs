//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    /// ファイル内の仮想アドレス（ロードバイアス適用前）
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前を取得（デマングル可能ならデマングル後、できなければマングル名）
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
///
/// Cのシンボルはそのまま返ります。
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソートしたシンボル
    symbols_by_address: Vec<Symbol>,
    /// PIE（Position Independent Executable）かどうか
    is_pie: bool,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    ///
    /// `.symtab` が strip されている場合に備えて `.dynsym` も読み込みます。
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let object_file = loader.object_file();
        let symbols = object_file.symbols().chain(object_file.dynamic_symbols());
        let mut resolver = Self::from_symbols(symbols.filter_map(|symbol| {
            if symbol.is_undefined() || !matches!(symbol.kind(), SymbolKind::Text | SymbolKind::Data) {
                return None;
            }
            let name = symbol.name().ok()?;
            if name.is_empty() {
                return None;
            }
            Some(Symbol::new(name.to_string(), symbol.address(), symbol.size()))
        }));
        resolver.is_pie = loader.is_pie();

        tracing::debug!(
            path = %loader.path().display(),
            count = resolver.symbols_by_address.len(),
            "loaded symbols"
        );
        Ok(resolver)
    }

    /// シンボル列から構築する
    pub fn from_symbols(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        let mut symbols_by_name = HashMap::new();
        let mut symbols_by_address = Vec::new();

        for sym in symbols {
            symbols_by_name.entry(sym.name.clone()).or_insert_with(|| sym.clone());
            symbols_by_address.push(sym);
        }

        symbols_by_address.sort_by_key(|s| s.address);
        symbols_by_address.dedup_by(|a, b| a.address == b.address && a.name == b.name);

        Self {
            symbols_by_name,
            symbols_by_address,
            is_pie: false,
        }
    }

    /// PIE（Position Independent Executable）かどうかを取得する
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// シンボル数
    pub fn len(&self) -> usize {
        self.symbols_by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols_by_address.is_empty()
    }

    /// シンボル名からアドレスを解決する
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name.get(symbol).map(|s| s.address)
    }

    /// アドレスを含むシンボルと、その先頭からのオフセットを返す
    ///
    /// サイズ情報のないシンボルは、次のシンボルまでを範囲とみなします。
    pub fn lookup(&self, addr: u64) -> Option<(&Symbol, u64)> {
        let idx = self
            .symbols_by_address
            .partition_point(|s| s.address <= addr)
            .checked_sub(1)?;

        // 同じアドレスに複数ある場合、サイズを持つものを優先する
        let mut best = idx;
        while best > 0
            && self.symbols_by_address[best - 1].address == self.symbols_by_address[idx].address
            && self.symbols_by_address[best].size == 0
        {
            best -= 1;
        }

        let sym = &self.symbols_by_address[best];
        let offset = addr - sym.address;
        if sym.size > 0 && offset >= sym.size {
            return None;
        }
        Some((sym, offset))
    }

    /// アドレスからシンボルを解決する（最も近いシンボルを返す）
    pub fn reverse_resolve(&self, addr: u64) -> Option<Symbol> {
        self.lookup(addr).map(|(sym, _)| sym.clone())
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> SymbolResolver {
        SymbolResolver::from_symbols([
            Symbol::new("mm_scheduler_main".into(), 0x1000, 0x40),
            Symbol::new("worker".into(), 0x1100, 0),
            Symbol::new("_ZN4core3fmt5write17h0123456789abcdefE".into(), 0x2000, 0x10),
        ])
    }

    #[test]
    fn test_lookup_inside_sized_symbol() {
        let r = resolver();
        let (sym, off) = r.lookup(0x1010).unwrap();
        assert_eq!(sym.name, "mm_scheduler_main");
        assert_eq!(off, 0x10);
        assert!(r.lookup(0x1040).is_none());
        assert!(r.lookup(0x0fff).is_none());
    }

    #[test]
    fn test_lookup_unsized_symbol_extends() {
        let r = resolver();
        let (sym, off) = r.lookup(0x1180).unwrap();
        assert_eq!(sym.name, "worker");
        assert_eq!(off, 0x80);
    }

    #[test]
    fn test_resolve_and_demangle() {
        let r = resolver();
        assert_eq!(r.resolve("worker"), Some(0x1100));
        assert_eq!(r.resolve("missing"), None);
        let sym = r.reverse_resolve(0x2004).unwrap();
        assert_eq!(sym.display_name(), "core::fmt::write");
    }
}
