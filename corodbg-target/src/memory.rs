//! メモリアクセス機能
//!
//! 停止中のプロセスのメモリを読み取り専用でアクセスします。

use crate::Result;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom};

/// メモリから読み取り可能な型
pub trait MemoryReadable: Sized {
    /// リトルエンディアンのバイト配列から値を構築
    fn from_le_bytes(bytes: &[u8]) -> Result<Self>;

    /// 型のサイズ（バイト数）
    fn size() -> usize;
}

macro_rules! impl_memory_readable {
    ($($ty:ty),+) => {
        $(
            impl MemoryReadable for $ty {
                fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
                    let array: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                        anyhow::anyhow!(
                            "Failed to convert {} bytes to {} (expected {} bytes)",
                            bytes.len(),
                            stringify!($ty),
                            std::mem::size_of::<$ty>()
                        )
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }

                fn size() -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )+
    };
}

impl_memory_readable!(u8, u16, u32, u64);

/// メモリマッピング情報（/proc/<pid>/maps の1行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// マッピング元ファイル内のオフセット
    pub offset: u64,
    /// マッピング元のパス（無名マッピングの場合はNone）
    pub path: Option<String>,
}

impl MemoryMapping {
    /// /proc/<pid>/maps の1行をパースする
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    /// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let range = parts.next()?;
        let perms = parts.next()?;
        let offset = parts.next()?;
        let _dev = parts.next()?;
        let _inode = parts.next()?;
        let path = parts.collect::<Vec<_>>().join(" ");

        let (start, end) = range.split_once('-')?;
        let start = u64::from_str_radix(start, 16).ok()?;
        let end = u64::from_str_radix(end, 16).ok()?;
        let offset = u64::from_str_radix(offset, 16).ok()?;

        let perms = perms.as_bytes();
        Some(Self {
            start,
            end,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset,
            path: if path.starts_with('/') { Some(path) } else { None },
        })
    }

    /// アドレスがこのマッピングに含まれるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// メモリからデータを読み取る
    ///
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    pub fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    if io_err.raw_os_error() == Some(nix::libc::EIO) {
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr as u64))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// 型付き値を読み取る（ジェネリック版）
    ///
    /// # Examples
    /// ```ignore
    /// let value: u64 = memory.read_typed(addr)?;
    /// let value: u32 = memory.read_typed(addr)?;
    /// ```
    pub fn read_typed<T: MemoryReadable>(&self, addr: usize) -> Result<T> {
        let bytes = self.read(addr, T::size())?;
        T::from_le_bytes(&bytes)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = MemoryMapping::parse_line(&line?) {
                mappings.push(mapping);
            }
        }

        Ok(mappings)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    pub fn read_via_ptrace(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr)
                .map_err(|e| anyhow::anyhow!("Failed to read via ptrace at 0x{:x}: {}", addr + offset, e))?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }
}

/// corodbg_dwarfのMemoryReaderトレイトを実装
impl corodbg_dwarf::MemoryReader for Memory {
    fn read_u8(&self, addr: usize) -> Result<u8> {
        self.read_typed(addr)
    }

    fn read_u16(&self, addr: usize) -> Result<u16> {
        self.read_typed(addr)
    }

    fn read_u32(&self, addr: usize) -> Result<u32> {
        self.read_typed(addr)
    }

    fn read_u64(&self, addr: usize) -> Result<u64> {
        self.read_typed(addr)
    }

    fn read(&self, addr: usize, size: usize) -> Result<Vec<u8>> {
        self.read(addr, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_mapping() {
        let line = "7f1234567000-7f1234568000 r-xp 00002000 08:01 123456     /usr/lib/libc.so.6";
        let m = MemoryMapping::parse_line(line).unwrap();
        assert_eq!(m.start, 0x7f1234567000);
        assert_eq!(m.end, 0x7f1234568000);
        assert!(m.readable && !m.writable && m.executable);
        assert_eq!(m.offset, 0x2000);
        assert_eq!(m.path.as_deref(), Some("/usr/lib/libc.so.6"));
        assert!(m.contains(0x7f1234567fff));
        assert!(!m.contains(0x7f1234568000));
    }

    #[test]
    fn test_parse_anonymous_mapping() {
        let m = MemoryMapping::parse_line("7ffd0000-7ffd1000 rw-p 00000000 00:00 0 [stack]").unwrap();
        assert!(m.path.is_none());
        assert!(m.writable);

        let m = MemoryMapping::parse_line("7ffd0000-7ffd1000 rw-p 00000000 00:00 0").unwrap();
        assert!(m.path.is_none());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(MemoryMapping::parse_line("").is_none());
        assert!(MemoryMapping::parse_line("zzzz-1000 r-xp 0 0 0").is_none());
    }

    #[test]
    fn test_read_own_memory() {
        let value: u64 = 0x1122_3344_5566_7788;
        let memory = Memory::new(std::process::id() as i32);
        let read: u64 = memory.read_typed(&value as *const u64 as usize).unwrap();
        assert_eq!(read, value);
    }
}
