//! corodbg DWARF デバッグ情報解析
//!
//! このクレートは、ELFファイルとDWARFデバッグ情報の解析機能を提供します。
//! 型テーブル（構造体フィールドのオフセット）、グローバル変数・TLS変数の索引、
//! シンボル解決、.eh_frame による CFI、ソース行の検索、型付き値のフォーマットを行います。

pub mod loader;
pub mod symbols;
pub mod lines;
pub mod types;
pub mod type_info;
pub mod variables;
pub mod cfi;
pub mod value_formatter;

pub use loader::{DwarfLoader, TlsSegment};
pub use symbols::{Symbol, SymbolResolver};
pub use lines::{LineInfo, LineInfoProvider};
pub use types::{BaseEncoding, Enumerator, Member, TypeDesc, TypeId, TypeKind, TypeTable};
pub use type_info::{DebugInfo, TypeInfoExtractor};
pub use variables::{VariableIndex, VariableInfo, VariableLocation};
pub use cfi::{CfiTable, FrameRules, SavedRule};
pub use value_formatter::{FormatOptions, MemoryReader, ValueFormatter};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
