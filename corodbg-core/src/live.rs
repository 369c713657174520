//! 実プロセスに対する [`TargetHost`] の実装
//!
//! 全スレッドに ptrace でアタッチし、実行ファイルの DWARF から型と変数を、
//! `/proc/<pid>/maps` に現れる各ファイルから ELF シンボルと `.eh_frame` を読み込みます。
//! ファイル内の仮想アドレスは、ファイルオフセット0のマッピングから求めたロードバイアスで
//! 実行時アドレスに変換します。

use crate::host::{TargetHost, VariableRef};
use crate::Result;
use corodbg_dwarf::{
    CfiTable, DebugInfo, DwarfLoader, FrameRules, LineInfoProvider, MemoryReader, SymbolResolver, TypeTable,
    VariableLocation,
};
use corodbg_target::{Memory, MemoryMapping, Process, RegisterSet, Registers, Thread, ThreadId};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 1つのロード済みファイル
struct Module {
    path: String,
    start: u64,
    end: u64,
    bias: u64,
    symbols: SymbolResolver,
    cfi: CfiTable,
}

impl Module {
    fn from_loader(loader: &DwarfLoader, path: String, range: &MappedRange) -> Result<Self> {
        let bias = range.base.wrapping_sub(loader.first_segment_vaddr());
        Ok(Self {
            path,
            start: range.start,
            end: range.end,
            bias,
            symbols: SymbolResolver::new(loader)?,
            cfi: CfiTable::new(loader.object_file())?,
        })
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// 同じファイルのマッピングをまとめた範囲
#[derive(Debug, Clone, Copy)]
struct MappedRange {
    start: u64,
    end: u64,
    /// ファイルオフセット0のマッピング先頭
    base: u64,
    executable: bool,
}

fn group_mappings(mappings: &[MemoryMapping]) -> BTreeMap<String, MappedRange> {
    let mut ranges: BTreeMap<String, MappedRange> = BTreeMap::new();
    for mapping in mappings {
        let Some(path) = &mapping.path else {
            continue;
        };
        let range = ranges.entry(path.clone()).or_insert(MappedRange {
            start: mapping.start,
            end: mapping.end,
            base: mapping.start,
            executable: false,
        });
        range.start = range.start.min(mapping.start);
        range.end = range.end.max(mapping.end);
        range.executable |= mapping.executable;
        if mapping.offset == 0 {
            range.base = mapping.start;
        }
    }
    ranges
}

/// 実行ファイルのマッピングを探す
///
/// `candidates`（`/proc/<pid>/exe` のリンク先、読み込んだパス）の順に照合し、見つかったパスも返します。
/// どれも一致しなければロードバイアス0として、ファイル自身のロードセグメントの範囲を使います。
fn executable_range(
    ranges: &BTreeMap<String, MappedRange>,
    candidates: &[String],
    segment_span: Option<(u64, u64)>,
    first_vaddr: u64,
) -> (Option<String>, MappedRange) {
    if let Some((path, range)) = candidates
        .iter()
        .find_map(|path| ranges.get(path).map(|range| (path.clone(), *range)))
    {
        return (Some(path), range);
    }

    let (start, end) = segment_span.unwrap_or((0, 0));
    warn!(
        start = format_args!("0x{:x}", start),
        end = format_args!("0x{:x}", end),
        "executable not found in the memory map; assuming it is not relocated"
    );
    (
        None,
        MappedRange {
            start,
            end,
            base: first_vaddr,
            executable: true,
        },
    )
}

/// アタッチ中のプロセス
pub struct LiveTarget {
    process: Process,
    memory: Memory,
    loader: DwarfLoader,
    debug_info: DebugInfo,
    lines: Option<LineInfoProvider>,
    /// 先頭は実行ファイル
    modules: Vec<Module>,
}

impl LiveTarget {
    /// プロセスにアタッチする
    ///
    /// `binary` を省略すると `/proc/<pid>/exe` を読み込みます。
    pub fn attach(pid: i32, binary: Option<&Path>) -> Result<Self> {
        let binary = binary
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(format!("/proc/{}/exe", pid)));

        let loader = DwarfLoader::load(&binary)?;
        let debug_info = DebugInfo::load(&loader)?;
        let lines = match LineInfoProvider::new(&loader) {
            Ok(lines) => Some(lines),
            Err(e) => {
                warn!(path = %binary.display(), "no line information: {}", e);
                None
            }
        };
        debug!(
            types = debug_info.types.len(),
            variables = debug_info.variables.len(),
            "loaded debug information"
        );

        let process = Process::attach(pid)?;
        let memory = Memory::new(pid);
        let ranges = group_mappings(&memory.get_mappings()?);

        let candidates: Vec<String> = [
            fs::read_link(format!("/proc/{}/exe", pid)).ok(),
            fs::canonicalize(&binary).ok(),
            Some(binary.clone()),
        ]
        .into_iter()
        .flatten()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
        let (exe, exe_range) = executable_range(
            &ranges,
            &candidates,
            loader.segment_span(),
            loader.first_segment_vaddr(),
        );

        let mut modules = vec![Module::from_loader(
            &loader,
            binary.to_string_lossy().into_owned(),
            &exe_range,
        )?];
        for (path, range) in &ranges {
            if Some(path) == exe.as_ref() || !range.executable {
                continue;
            }
            match DwarfLoader::load(path).and_then(|lib| Module::from_loader(&lib, path.clone(), range)) {
                Ok(module) => modules.push(module),
                Err(e) => debug!(path = %path, "skipping mapping: {}", e),
            }
        }

        info!(
            pid,
            threads = process.threads().len(),
            modules = modules.len(),
            bias = format_args!("0x{:x}", modules[0].bias),
            "attached"
        );

        Ok(Self {
            process,
            memory,
            loader,
            debug_info,
            lines,
            modules,
        })
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    /// 実行ファイルのロードバイアス
    pub fn load_bias(&self) -> u64 {
        self.modules[0].bias
    }

    /// 読み込んだファイルのパス（実行ファイルが先頭）
    pub fn module_paths(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(|m| m.path.as_str())
    }

    fn module_for(&self, address: u64) -> Option<&Module> {
        self.modules.iter().find(|m| m.contains(address))
    }

    /// 実行ファイルの静的TLSブロックにある変数のアドレス
    ///
    /// x86_64（TLS variant II）のみ: `fs_base - round_up(memsz, align) + offset`
    fn tls_address(&self, tid: ThreadId, offset: u64) -> Result<u64> {
        if self.loader.arch_name() != "x86_64" {
            return Err(anyhow::anyhow!(
                "Thread-local variables are not supported on {}",
                self.loader.arch_name()
            ));
        }
        let segment = self
            .loader
            .tls_segment()
            .ok_or_else(|| anyhow::anyhow!("Executable has no PT_TLS segment"))?;
        let tp = Registers::new(tid)
            .read_set()?
            .get("fs_base")
            .ok_or_else(|| anyhow::anyhow!("Cannot read fs_base of thread {}", tid))?;
        Ok(tp.wrapping_sub(segment.block_offset_from_tp()).wrapping_add(offset))
    }
}

impl TargetHost for LiveTarget {
    fn arch_name(&self) -> &str {
        self.loader.arch_name()
    }

    fn threads(&self) -> Vec<Thread> {
        self.process.threads().to_vec()
    }

    fn thread_registers(&self, tid: ThreadId) -> Result<RegisterSet> {
        Registers::new(tid).read_set()
    }

    fn memory(&self) -> &dyn MemoryReader {
        &self.memory
    }

    fn types(&self) -> &TypeTable {
        &self.debug_info.types
    }

    fn variable(&self, tid: ThreadId, name: &str) -> Result<Option<VariableRef>> {
        let Some(info) = self.debug_info.variables.lookup(name) else {
            return Ok(None);
        };
        let ty = info
            .ty
            .ok_or_else(|| anyhow::anyhow!("'{}' has unknown type", name))?;
        let address = match info.location {
            VariableLocation::Static(address) => address.wrapping_add(self.load_bias()),
            VariableLocation::Tls(offset) => self.tls_address(tid, offset)?,
            VariableLocation::Unknown => {
                return Err(anyhow::anyhow!("Cannot determine the address of '{}'", name));
            }
        };
        debug!(name, tid, address = format_args!("0x{:x}", address), "resolved variable");
        Ok(Some(VariableRef { address, ty }))
    }

    fn symbolize(&self, address: u64) -> Option<String> {
        let module = self.module_for(address)?;
        let (symbol, offset) = module.symbols.lookup(address.wrapping_sub(module.bias))?;
        Some(if offset == 0 {
            symbol.display_name().to_string()
        } else {
            format!("{}+{}", symbol.display_name(), offset)
        })
    }

    fn source_line(&self, address: u64) -> Option<String> {
        let main = &self.modules[0];
        if !main.contains(address) {
            return None;
        }
        let lines = self.lines.as_ref()?;
        match lines.lookup(address.wrapping_sub(main.bias)) {
            Ok(line) => line.map(|l| l.to_string()),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }

    fn frame_rules(&self, pc: u64) -> Option<FrameRules> {
        let module = self.module_for(pc)?;
        module.cfi.rules_for(pc.wrapping_sub(module.bias))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_mappings() {
        let lines = [
            "555555554000-555555556000 r--p 00000000 08:01 42 /usr/bin/odyssey",
            "555555556000-55555555a000 r-xp 00002000 08:01 42 /usr/bin/odyssey",
            "55555555a000-55555555c000 rw-p 00006000 08:01 42 /usr/bin/odyssey",
            "7ffff7dd3000-7ffff7dd5000 r--p 00000000 08:01 7 /usr/lib/libdata.so",
            "7ffffffde000-7ffffffff000 rw-p 00000000 00:00 0 [stack]",
        ];
        let mappings: Vec<MemoryMapping> = lines.iter().filter_map(|l| MemoryMapping::parse_line(l)).collect();
        let ranges = group_mappings(&mappings);

        assert_eq!(ranges.len(), 2);
        let exe = ranges["/usr/bin/odyssey"];
        assert_eq!(exe.start, 0x5555_5555_4000);
        assert_eq!(exe.end, 0x5555_5555_c000);
        assert_eq!(exe.base, 0x5555_5555_4000);
        assert!(exe.executable);
        assert!(!ranges["/usr/lib/libdata.so"].executable);
    }

    fn odyssey_ranges() -> BTreeMap<String, MappedRange> {
        let lines = [
            "555555554000-555555556000 r--p 00000000 08:01 42 /usr/bin/odyssey",
            "555555556000-55555555a000 r-xp 00002000 08:01 42 /usr/bin/odyssey",
            "7ffff7c00000-7ffff7d00000 r-xp 00000000 08:01 7 /usr/lib/libc.so.6",
        ];
        let mappings: Vec<MemoryMapping> = lines.iter().filter_map(|l| MemoryMapping::parse_line(l)).collect();
        group_mappings(&mappings)
    }

    #[test]
    fn test_executable_range_by_loaded_path() {
        let ranges = odyssey_ranges();
        let candidates = vec!["/proc/1/exe-gone".to_string(), "/usr/bin/odyssey".to_string()];
        let (path, range) = executable_range(&ranges, &candidates, Some((0, 0x6000)), 0);
        assert_eq!(path.as_deref(), Some("/usr/bin/odyssey"));
        assert_eq!(range.base, 0x5555_5555_4000);
    }

    #[test]
    fn test_executable_range_fallback_does_not_cover_libraries() {
        let ranges = odyssey_ranges();
        let candidates = vec!["/tmp/odyssey (deleted)".to_string()];
        let (path, range) = executable_range(&ranges, &candidates, Some((0x400000, 0x4a0000)), 0x400000);
        assert!(path.is_none());
        assert_eq!((range.start, range.end), (0x400000, 0x4a0000));
        assert_eq!(range.base, 0x400000);

        let libc = ranges["/usr/lib/libc.so.6"];
        assert!(!(range.start..range.end).contains(&libc.start));
    }
}
