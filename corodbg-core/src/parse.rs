//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポートします。
/// 10進数として読めない数字列（`7fff1000` など）は16進数として扱います。
///
/// # Examples
/// ```
/// use corodbg_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e));
    }

    s.parse::<u64>()
        .or_else(|_| u64::from_str_radix(s, 16))
        .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
}
