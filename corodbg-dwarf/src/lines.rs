//! ソース行情報

use crate::{DwarfLoader, Result};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl std::fmt::Display for LineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// ソース行情報の取得
///
/// addr2line のコンテキストを保持します。アドレスはファイル内の仮想アドレスです。
pub struct LineInfoProvider {
    context: addr2line::Context<crate::loader::DwarfSlice>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let dwarf = loader.reload_dwarf()?;
        let context = addr2line::Context::from_dwarf(dwarf)
            .map_err(|e| anyhow::anyhow!("Failed to build line table: {}", e))?;
        Ok(Self { context })
    }

    /// アドレスからソース行情報を取得する
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let location = self
            .context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Line lookup failed at 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| {
            Some(LineInfo {
                file: loc.file?.to_string(),
                line: loc.line?,
                column: loc.column,
            })
        }))
    }
}
