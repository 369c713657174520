//! スケジューラのコルーチン列挙
//!
//! スレッドごとのランタイムインスタンス（アンカー変数が指すマシン）から、
//! active リストと ready リストを辿ってコルーチンの集合を作ります。

use crate::error::{InspectError, Result};
use crate::layout::RuntimeLayout;
use crate::list::{ListBound, ListWalker};
use crate::remote::{lookup_type, RemoteValue};
use corodbg_dwarf::{MemoryReader, TypeTable};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

/// アンカー変数の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorState {
    /// シンボルがない（ランタイムを使っていないプロセス）
    Missing,
    /// NULL（このスレッドではランタイムが動いていない）
    Null,
    /// マシンのアドレス
    Present(u64),
}

/// コルーチンの状態タグ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoroutineState {
    pub value: i64,
    /// 列挙子名（`MM_CREADY` など）
    pub name: Option<String>,
}

impl fmt::Display for CoroutineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.value),
        }
    }
}

/// 1つのコルーチンのスナップショット
///
/// コマンド1回の間だけ有効です。ターゲットが再開したら読み直す必要があります。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coroutine {
    /// レコードのアドレス
    pub address: u64,
    pub id: u64,
    pub state: CoroutineState,
    pub errno: i64,
    /// エントリ関数のアドレス
    pub function: u64,
    pub arg: Option<u64>,
    pub name: Option<String>,
    /// 保存コンテキストのスタックポインタ
    pub context_sp: u64,
    /// スケジューラの current と同じレコード
    pub is_current: bool,
}

/// 1スレッド分の列挙結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoroutineSet {
    pub anchor: AnchorState,
    /// active リスト、続いて ready リスト（重複なし）
    pub entries: Vec<Coroutine>,
    /// スケジューラの current（リストに含まれないこともある）
    pub current: Option<Coroutine>,
}

impl CoroutineSet {
    fn empty(anchor: AnchorState) -> Self {
        Self {
            anchor,
            entries: Vec::new(),
            current: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// IDでコルーチンを探す（リストになければ current も見る）
    pub fn find(&self, id: u64) -> Option<&Coroutine> {
        self.entries
            .iter()
            .find(|c| c.id == id)
            .or_else(|| self.current.as_ref().filter(|c| c.id == id))
    }
}

/// コルーチン列挙器
pub struct CoroutineEnumerator<'a, 't> {
    layout: &'a RuntimeLayout,
    types: &'t TypeTable,
}

impl<'a, 't> CoroutineEnumerator<'a, 't> {
    pub fn new(layout: &'a RuntimeLayout, types: &'t TypeTable) -> Self {
        Self { layout, types }
    }

    /// アンカー変数の値からマシンの状態を判定する
    ///
    /// `anchor` はアンカー変数そのもの（ポインタ型の値）で、シンボルがなければ None です。
    pub fn anchor_state(&self, memory: &dyn MemoryReader, anchor: Option<RemoteValue<'t>>) -> Result<AnchorState> {
        match anchor {
            None => Ok(AnchorState::Missing),
            Some(anchor) => match anchor.read_pointer(memory)? {
                0 => Ok(AnchorState::Null),
                machine => Ok(AnchorState::Present(machine)),
            },
        }
    }

    /// 1スレッド分のコルーチンを列挙する
    ///
    /// ランタイムがない、またはアンカーが NULL の場合は空の集合を返します。
    pub fn enumerate(&self, memory: &dyn MemoryReader, anchor: Option<RemoteValue<'t>>) -> Result<CoroutineSet> {
        let state = self.anchor_state(memory, anchor)?;
        let machine = match (state, anchor) {
            (AnchorState::Present(_), Some(anchor)) => match anchor.deref(memory)? {
                Some(machine) => machine,
                None => return Ok(CoroutineSet::empty(AnchorState::Null)),
            },
            _ => {
                debug!(anchor = %self.layout.anchor, ?state, "no runtime instance");
                return Ok(CoroutineSet::empty(state));
            }
        };

        let layout = self.layout;
        let scheduler = machine.field(&layout.scheduler_field)?;
        let current_addr = scheduler.field(&layout.current_field)?.read_pointer(memory)?;

        let coroutine_ty = lookup_type(self.types, &layout.coroutine_type)?;
        let walker = ListWalker::new(self.types, coroutine_ty, &layout.link_field, &layout.next_field)?;

        let mut entries = Vec::new();
        let mut seen = HashSet::new();
        for (count_field, list_field) in [
            (&layout.count_active_field, &layout.list_active_field),
            (&layout.count_ready_field, &layout.list_ready_field),
        ] {
            let count = scheduler.field(count_field)?.read_signed(memory)?;
            let count = u64::try_from(count).map_err(|_| {
                InspectError::MalformedRuntimeState(format!("{} is negative ({})", count_field, count))
            })?;
            let head = scheduler.field(list_field)?.address();

            for record in walker.walk(memory, head, ListBound::Count(count))? {
                if !seen.insert(record.address()) {
                    debug!(address = format_args!("0x{:x}", record.address()), "coroutine listed twice");
                    continue;
                }
                let mut coroutine = self.decode(memory, record)?;
                coroutine.is_current = record.address() == current_addr;
                entries.push(coroutine);
            }
        }

        let current = if current_addr == 0 {
            None
        } else {
            let mut current = self.decode(memory, RemoteValue::new(current_addr, coroutine_ty, self.types))?;
            current.is_current = true;
            Some(current)
        };

        Ok(CoroutineSet {
            anchor: AnchorState::Present(machine.address()),
            entries,
            current,
        })
    }

    /// コルーチンレコードを読み取る
    pub fn decode(&self, memory: &dyn MemoryReader, record: RemoteValue<'t>) -> Result<Coroutine> {
        let layout = self.layout;
        let state_value = record.field(&layout.state_field)?;
        let state = state_value.read_signed(memory)?;

        let arg = match record.try_field(&layout.arg_field) {
            Some(arg) => Some(arg.read_pointer(memory)?),
            None => None,
        };
        let name = match record.try_field(&layout.name_field) {
            Some(name) => Some(name.read_c_string(memory)?).filter(|n| !n.is_empty()),
            None => None,
        };

        Ok(Coroutine {
            address: record.address(),
            id: record.field(&layout.id_field)?.read_unsigned(memory)?,
            state: CoroutineState {
                value: state,
                name: state_value.enumerator_name(state).map(str::to_string),
            },
            errno: record.field(&layout.errno_field)?.read_signed(memory)?,
            function: record.field(&layout.function_field)?.read_pointer(memory)?,
            arg,
            name,
            context_sp: record
                .field(&layout.context_field)?
                .field(&layout.sp_field)?
                .read_pointer(memory)?,
            is_current: false,
        })
    }
}
