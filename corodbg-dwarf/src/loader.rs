//! ELFとDWARFの読み込み機能

use crate::Result;
use object::read::elf::{ElfFile, FileHeader, ProgramHeader as _};
use object::{Object, ObjectSection, ObjectSegment};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// DWARFセクションのリーダー型
pub type DwarfSlice = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// PT_TLS セグメント情報（静的TLSブロックの配置計算に使う）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSegment {
    pub memsz: u64,
    pub align: u64,
}

impl TlsSegment {
    /// x86_64（TLS variant II）でのスレッドポインタからのブロック先頭までの距離
    ///
    /// ブロックは `tp - round_up(memsz, align)` から始まります。
    pub fn block_offset_from_tp(&self) -> u64 {
        let align = self.align.max(1);
        self.memsz.div_ceil(align) * align
    }
}

/// DWARFローダー
pub struct DwarfLoader {
    /// 読み込んだファイルのパス
    path: PathBuf,
    /// ファイルの生データ（'static にリークしたもの）
    data: &'static [u8],
    /// オブジェクトファイル
    object_file: Rc<object::File<'static>>,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<DwarfSlice>,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // gimliのセクション参照に'staticライフタイムが必要なためリークする
        let data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let dwarf = load_dwarf(&object_file)?;

        debug!(path = %path.display(), arch = ?object_file.architecture(), "loaded object file");

        Ok(Self {
            path: path.to_path_buf(),
            data,
            object_file: Rc::new(object_file),
            dwarf,
        })
    }

    /// 読み込んだファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// ファイルの生データ
    pub fn data(&self) -> &'static [u8] {
        self.data
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfSlice> {
        &self.dwarf
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 同じセクションからDWARFコンテキストをもう一つ構築する
    ///
    /// addr2line のコンテキストは Dwarf を所有するため、別インスタンスを渡します。
    pub fn reload_dwarf(&self) -> Result<gimli::Dwarf<DwarfSlice>> {
        load_dwarf(&self.object_file)
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// ET_DYN (Dynamic/Shared Object) = PIE実行ファイルまたは共有ライブラリ
    /// ET_EXEC (Executable) = 非PIE実行ファイル
    pub fn is_pie(&self) -> bool {
        matches!(self.object_file.kind(), object::ObjectKind::Dynamic)
    }

    /// アーキテクチャ名（"x86_64", "i386", "aarch64" など）
    pub fn arch_name(&self) -> &'static str {
        match self.object_file.architecture() {
            object::Architecture::X86_64 => "x86_64",
            object::Architecture::X86_64_X32 => "x86_64:x32",
            object::Architecture::I386 => "i386",
            object::Architecture::Aarch64 => "aarch64",
            object::Architecture::Arm => "arm",
            object::Architecture::Riscv64 => "riscv64",
            _ => "unknown",
        }
    }

    /// ファイルオフセット0を含むロードセグメントの仮想アドレス（ページ境界に切り下げ）
    ///
    /// 実行時のマッピング先頭アドレスからこの値を引くとロードバイアスになります。
    pub fn first_segment_vaddr(&self) -> u64 {
        self.object_file
            .segments()
            .find(|seg| seg.file_range().0 == 0)
            .map(|seg| seg.address() & !0xfff)
            .unwrap_or(0)
    }

    /// ロードセグメントが覆う仮想アドレス範囲 `[start, end)`
    pub fn segment_span(&self) -> Option<(u64, u64)> {
        self.object_file.segments().fold(None, |span, seg| {
            let start = seg.address();
            let end = start.saturating_add(seg.size());
            Some(match span {
                None => (start, end),
                Some((s, e)) => (s.min(start), e.max(end)),
            })
        })
    }

    /// PT_TLS セグメントを取得する
    pub fn tls_segment(&self) -> Option<TlsSegment> {
        match &*self.object_file {
            object::File::Elf64(elf) => tls_segment_of(elf),
            object::File::Elf32(elf) => tls_segment_of(elf),
            _ => None,
        }
    }
}

fn tls_segment_of<Elf: FileHeader>(elf: &ElfFile<'static, Elf>) -> Option<TlsSegment> {
    let endian = elf.endian();
    elf.elf_program_headers()
        .iter()
        .find(|ph| ph.p_type(endian) == object::elf::PT_TLS)
        .map(|ph| TlsSegment {
            memsz: ph.p_memsz(endian).into(),
            align: ph.p_align(endian).into(),
        })
}

fn load_dwarf(object_file: &object::File<'static>) -> Result<gimli::Dwarf<DwarfSlice>> {
    let endian = if object_file.is_little_endian() {
        gimli::RunTimeEndian::Little
    } else {
        gimli::RunTimeEndian::Big
    };

    let load_section = |id: gimli::SectionId| -> Result<DwarfSlice> {
        let data = object_file
            .section_by_name(id.name())
            .and_then(|section| section.data().ok())
            .unwrap_or(&[]);
        Ok(gimli::EndianSlice::new(data, endian))
    };

    gimli::Dwarf::load(load_section)
        .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
}
