//! コマンドセッション
//!
//! 1行のコマンドをパースして実行し、結果を出力先に書き込みます。
//! `coroutine` コマンドの内側のコマンドも同じ [`Session::execute`] で再帰的に実行します。

use crate::bridge::{ArmGuard, SkipFirstFrame, UnwindBridge};
use crate::command::{Command, CoroutineTarget};
use crate::focus::{Focus, FocusGuard};
use crate::host::TargetHost;
use crate::parse::parse_address;
use crate::select::{find_coroutine, find_thread, select_threads};
use crate::unwind::{Frame, FrameWalker};
use crate::Result;
use corodbg_coro::{
    field_offset, lookup_type, reconstruct, AnchorState, ArchProfile, Coroutine, CoroutineEnumerator, CoroutineSet,
    InspectError, ListBound, ListWalker, RemoteValue, RuntimeLayout, DUMP_LIST_LIMIT,
};
use corodbg_dwarf::{FormatOptions, ValueFormatter};
use corodbg_target::{RegisterSet, Thread, ThreadId};
use std::io::Write;
use std::rc::Rc;
use tracing::debug;

/// コマンド実行後の継続可否
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// デバッグセッション
pub struct Session<H: TargetHost> {
    host: H,
    layout: RuntimeLayout,
    walker: FrameWalker,
    bridge: Rc<UnwindBridge>,
    skip_first: Rc<SkipFirstFrame>,
    focus: Focus,
    /// 選択スレッドのフレーム列（フォーカスや武装状態が変わると破棄）
    frames: Option<Vec<Frame>>,
}

impl<H: TargetHost> Session<H> {
    /// 新しいセッションを作成する（最初のスレッドを選択）
    pub fn new(host: H) -> Self {
        let bridge = Rc::new(UnwindBridge::new());
        let skip_first = Rc::new(SkipFirstFrame::new());

        let mut walker = FrameWalker::with_default_unwinders();
        walker.prepend_unwinder(bridge.clone());
        walker.add_filter(skip_first.clone());

        let focus = Focus {
            thread: host.threads().first().map(|t| t.tid()),
            frame: 0,
        };

        Self {
            host,
            layout: RuntimeLayout::default(),
            walker,
            bridge,
            skip_first,
            focus,
            frames: None,
        }
    }

    /// ランタイムの名前の表を差し替える
    pub fn with_layout(mut self, layout: RuntimeLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn layout(&self) -> &RuntimeLayout {
        &self.layout
    }

    pub fn focus(&self) -> Focus {
        self.focus
    }

    pub fn bridge(&self) -> &UnwindBridge {
        &self.bridge
    }

    pub fn frame_filter(&self) -> &SkipFirstFrame {
        &self.skip_first
    }

    /// 現在のフォーカスをドロップ時に復元するガードを作る
    pub fn focus_guard(&mut self) -> FocusGuard<'_, H> {
        FocusGuard::new(self)
    }

    pub(crate) fn restore_focus(&mut self, focus: Focus) {
        self.focus = focus;
        self.invalidate_frames();
    }

    /// フレームキャッシュを破棄する
    pub fn invalidate_frames(&mut self) {
        self.frames = None;
    }

    /// 選択中のスレッド
    pub fn selected_thread(&self) -> Result<Thread> {
        let tid = self.focus.thread.ok_or_else(|| anyhow::anyhow!("No thread selected."))?;
        self.host
            .threads()
            .into_iter()
            .find(|t| t.tid() == tid)
            .ok_or_else(|| anyhow::anyhow!("Selected thread {} no longer exists.", tid))
    }

    /// スレッドを選択する（フレームは最内に戻る）
    pub fn select_thread(&mut self, tid: ThreadId) {
        self.focus = Focus {
            thread: Some(tid),
            frame: 0,
        };
        self.invalidate_frames();
    }

    /// フレームを選択する
    pub fn select_frame(&mut self, index: usize) -> Result<()> {
        let count = self.frames()?.len();
        if index >= count {
            return Err(anyhow::anyhow!("No frame at level {}.", index));
        }
        self.focus.frame = index;
        Ok(())
    }

    /// 選択スレッドのフレーム列（巻き戻し器とフィルタを適用済み）
    pub fn frames(&mut self) -> Result<&[Frame]> {
        if self.frames.is_none() {
            let thread = self.selected_thread()?;
            let profile = ArchProfile::from_arch_name(self.host.arch_name())?;
            let regs = self.host.thread_registers(thread.tid())?;
            let frames = self.walker.walk(&self.host, profile, regs)?;
            debug!(tid = thread.tid(), count = frames.len(), "computed frames");
            self.frames = Some(frames);
        }
        Ok(self.frames.as_deref().unwrap_or_default())
    }

    /// 選択中のフレーム
    pub fn selected_frame(&mut self) -> Result<Frame> {
        let index = self.focus.frame;
        self.frames()?
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No stack."))
    }

    /// スレッドのコルーチンを列挙する
    pub fn coroutines(&self, tid: ThreadId) -> Result<CoroutineSet> {
        let types = self.host.types();
        let anchor = self
            .host
            .variable(tid, &self.layout.anchor)?
            .map(|v| RemoteValue::new(v.address, v.ty, types));
        let enumerator = CoroutineEnumerator::new(&self.layout, types);
        Ok(enumerator.enumerate(self.host.memory(), anchor)?)
    }

    /// 中断中のコルーチンのレジスタを復元する
    ///
    /// アーキテクチャを確認してから保存領域を読みます。
    pub fn reconstruct_coroutine(&self, coroutine: &Coroutine) -> Result<RegisterSet> {
        let profile = ArchProfile::from_arch_name(self.host.arch_name())?;
        if coroutine.is_current {
            return Err(InspectError::CoroutineRunning(coroutine.id).into());
        }
        Ok(reconstruct(profile, coroutine.context_sp, self.host.memory())?)
    }

    /// 1行のコマンドを実行する
    pub fn execute(&mut self, line: &str, out: &mut dyn Write) -> Result<Flow> {
        let Some(command) = Command::parse(line)? else {
            return Ok(Flow::Continue);
        };
        debug!(?command, "execute");

        match command {
            Command::Backtrace(limit) => self.backtrace(limit, out)?,
            Command::Frame(index) => self.frame(index, out)?,
            Command::Registers => {
                let frame = self.selected_frame()?;
                write!(out, "{}", frame.regs)?;
            }
            Command::Print(expr) => self.print(&expr, out)?,
            Command::InfoThreads => self.info_threads(out)?,
            Command::Thread(selector) => self.thread(selector.as_deref(), out)?,
            Command::ListCoroutines(selectors) => self.list_coroutines(&selectors, out)?,
            Command::RunInCoroutine { target, command } => {
                return self.run_in_coroutine_target(&target, &command, out);
            }
            Command::DumpList {
                head,
                element_type,
                link_field,
                field,
            } => self.dump_list(&head, &element_type, &link_field, field.as_deref(), out)?,
            Command::FieldOffset { ty, field } => {
                let types = self.host.types();
                let id = lookup_type(types, &ty)?;
                writeln!(out, "{}", field_offset(types, id, &field)?)?;
            }
            Command::Help => print_help(out)?,
            Command::Quit => return Ok(Flow::Quit),
        }

        Ok(Flow::Continue)
    }

    fn backtrace(&mut self, limit: Option<usize>, out: &mut dyn Write) -> Result<()> {
        let frames = self.frames()?.to_vec();
        let shown = limit.unwrap_or(frames.len());
        for (i, frame) in frames.iter().enumerate().take(shown) {
            writeln!(out, "{}", self.describe_frame(i, frame))?;
        }
        if shown < frames.len() {
            writeln!(out, "(More stack frames follow...)")?;
        }
        Ok(())
    }

    fn frame(&mut self, index: Option<usize>, out: &mut dyn Write) -> Result<()> {
        if let Some(index) = index {
            self.select_frame(index)?;
        }
        let frame = self.selected_frame()?;
        writeln!(out, "{}", self.describe_frame(self.focus.frame, &frame))?;
        Ok(())
    }

    /// `#N  0xPC in symbol+off at file:line`
    fn describe_frame(&self, index: usize, frame: &Frame) -> String {
        let mut line = format!("#{:<2} 0x{:016x}", index, frame.pc);
        if let Some(symbol) = self.host.symbolize(frame.pc) {
            line.push_str(&format!(" in {}", symbol));
        }
        // 呼び出し元フレームのPCは戻りアドレスなので、call命令の行を引く
        let lookup = if frame.unwinder.is_some() {
            frame.pc.saturating_sub(1)
        } else {
            frame.pc
        };
        if let Some(location) = self.host.source_line(lookup) {
            line.push_str(&format!(" at {}", location));
        }
        line
    }

    fn print(&mut self, expr: &str, out: &mut dyn Write) -> Result<()> {
        let value = self.evaluate(expr)?;
        writeln!(out, "{} = {}", expr, self.format_value(value)?)?;
        Ok(())
    }

    fn format_value(&self, value: RemoteValue<'_>) -> Result<String> {
        let symbolize = |address: u64| self.host.symbolize(address);
        let formatter = ValueFormatter::new(self.host.memory(), self.host.types()).with_symbolizer(&symbolize);
        formatter.format(value.address(), value.ty(), &FormatOptions::default())
    }

    /// `name`、`name.field`、`name->field` を選択スレッドで評価する
    ///
    /// ポインタに対する `.` は `->` と同じく参照先のフィールドを取ります。
    pub fn evaluate(&self, expr: &str) -> Result<RemoteValue<'_>> {
        let normalized = expr.trim().replace("->", ".");
        let mut segments = normalized.split('.').map(str::trim);
        let name = segments.next().unwrap_or_default();
        if name.is_empty() {
            return Err(anyhow::anyhow!("A syntax error in expression, near `{}'.", expr));
        }

        let tid = self.selected_thread()?.tid();
        let var = self
            .host
            .variable(tid, name)?
            .ok_or_else(|| InspectError::SymbolNotFound(name.to_string()))?;
        let mut value = RemoteValue::new(var.address, var.ty, self.host.types());

        for field in segments {
            if field.is_empty() {
                return Err(anyhow::anyhow!("A syntax error in expression, near `{}'.", expr));
            }
            if self.host.types().pointee(value.ty()).is_some() {
                value = value
                    .deref(self.host.memory())?
                    .ok_or(InspectError::MemoryRead {
                        address: 0,
                        reason: format!("{} is NULL", value.type_name()),
                    })?;
            }
            value = value.field(field)?;
        }
        Ok(value)
    }

    /// アドレス式（数値または変数パス）を評価する
    pub fn evaluate_address(&self, expr: &str) -> Result<u64> {
        if expr.starts_with(|c: char| c.is_ascii_digit()) {
            return parse_address(expr);
        }
        Ok(self.evaluate(expr)?.address())
    }

    fn info_threads(&mut self, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "  Id   Target Id             Frame")?;
        for thread in self.host.threads() {
            let marker = if Some(thread.tid()) == self.focus.thread { '*' } else { ' ' };
            let target = format!("Thread {} \"{}\"", thread.tid(), thread.name());
            let location = self
                .host
                .thread_registers(thread.tid())
                .ok()
                .and_then(|regs| {
                    let profile = ArchProfile::from_arch_name(self.host.arch_name()).ok()?;
                    regs.get(profile.layout().pc)
                })
                .map(|pc| match self.host.symbolize(pc) {
                    Some(symbol) => format!("0x{:x} in {}", pc, symbol),
                    None => format!("0x{:x}", pc),
                })
                .unwrap_or_default();
            writeln!(out, "{} {:<4} {:<21} {}", marker, thread.num(), target, location)?;
        }
        Ok(())
    }

    fn thread(&mut self, selector: Option<&str>, out: &mut dyn Write) -> Result<()> {
        let thread = match selector {
            Some(selector) => {
                let thread = find_thread(&self.host.threads(), selector)?;
                self.select_thread(thread.tid());
                write!(out, "[Switching to ")?;
                thread
            }
            None => {
                write!(out, "[Current thread is ")?;
                self.selected_thread()?
            }
        };
        writeln!(out, "{} (Thread {} \"{}\")]", thread.num(), thread.tid(), thread.name())?;
        Ok(())
    }

    fn list_coroutines(&mut self, selectors: &[String], out: &mut dyn Write) -> Result<()> {
        let selection = select_threads(&self.host.threads(), selectors);
        for selector in &selection.unmatched {
            writeln!(out, "{}", InspectError::ThreadNotFound(selector.clone()))?;
        }

        let mut guard = self.focus_guard();
        for thread in &selection.threads {
            guard.select_thread(thread.tid());
            writeln!(out, "Thread {} ({}) coroutines:", thread.num(), thread.name())?;
            if let Err(e) = guard.write_thread_coroutines(thread, out) {
                writeln!(out, " Error: {}", e)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn write_thread_coroutines(&self, thread: &Thread, out: &mut dyn Write) -> Result<()> {
        let set = self.coroutines(thread.tid())?;
        match set.anchor {
            AnchorState::Missing => {
                writeln!(
                    out,
                    " There is no {} in the current context. Does the executable use the coroutine runtime?",
                    self.layout.anchor
                )?;
                return Ok(());
            }
            AnchorState::Null => {
                writeln!(out, " {} is NULL, so no coroutines are available in this thread.", self.layout.anchor)?;
                return Ok(());
            }
            AnchorState::Present(_) => {}
        }

        writeln!(out, " Id\tState\t\terrno\tFunction")?;
        for coroutine in &set.entries {
            writeln!(out, "{}", self.describe_coroutine(coroutine))?;
        }
        Ok(())
    }

    fn describe_coroutine(&self, coroutine: &Coroutine) -> String {
        let marker = if coroutine.is_current { '*' } else { ' ' };
        let mut line = format!(
            "{}{}\t{}\t{}\t{}",
            marker,
            coroutine.id,
            coroutine.state,
            coroutine.errno,
            self.describe_code_address(coroutine.function)
        );
        if let Some(arg) = coroutine.arg {
            line.push_str(&format!("\targ=0x{:x}", arg));
        }
        if let Some(name) = &coroutine.name {
            line.push_str(&format!("\t\"{}\"", name));
        }
        line
    }

    fn describe_code_address(&self, address: u64) -> String {
        match self.host.symbolize(address) {
            Some(symbol) => format!("0x{:x} <{}>", address, symbol),
            None => format!("0x{:x}", address),
        }
    }

    fn run_in_coroutine_target(
        &mut self,
        target: &CoroutineTarget,
        command: &str,
        out: &mut dyn Write,
    ) -> Result<Flow> {
        match target {
            CoroutineTarget::One { thread, id } => {
                let thread = find_thread(&self.host.threads(), thread)?;
                let set = self.coroutines(thread.tid())?;
                let coroutine = find_coroutine(&set, &thread, *id)?.clone();
                self.run_in_coroutine(&thread, &coroutine, command, out)
            }
            CoroutineTarget::All => {
                for thread in self.host.threads() {
                    let set = match self.coroutines(thread.tid()) {
                        Ok(set) => set,
                        Err(e) => {
                            writeln!(out, "Thread {} ({}): Error: {}", thread.num(), thread.name(), e)?;
                            continue;
                        }
                    };
                    for coroutine in &set.entries {
                        writeln!(
                            out,
                            "Thread {} ({}) coroutine {}:",
                            thread.num(),
                            thread.name(),
                            coroutine.id
                        )?;
                        match self.run_in_coroutine(&thread, coroutine, command, out) {
                            Ok(Flow::Quit) => return Ok(Flow::Quit),
                            Ok(Flow::Continue) => {}
                            Err(e) => writeln!(out, "Error: {}", e)?,
                        }
                    }
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// コルーチンの文脈でコマンドを実行する
    ///
    /// コマンドが空ならレコードを表示します。実行中のコルーチンはスレッドの実フレームで、
    /// それ以外は復元したレジスタを巻き戻しに差し込んで実行します。
    /// どの場合もフォーカスと武装状態は戻ります。
    pub fn run_in_coroutine(
        &mut self,
        thread: &Thread,
        coroutine: &Coroutine,
        command: &str,
        out: &mut dyn Write,
    ) -> Result<Flow> {
        let mut guard = self.focus_guard();
        guard.select_thread(thread.tid());

        if command.trim().is_empty() {
            guard.print_coroutine_record(coroutine, out)?;
            return Ok(Flow::Continue);
        }
        if coroutine.is_current {
            let _suspended = ArmGuard::suspend(&guard.bridge, &guard.skip_first);
            guard.invalidate_frames();
            return guard.execute(command, out);
        }

        let regs = guard.reconstruct_coroutine(coroutine)?;
        debug!(tid = thread.tid(), id = coroutine.id, "running command in coroutine context");
        let _armed = ArmGuard::arm(&guard.bridge, &guard.skip_first, regs);
        guard.invalidate_frames();
        guard.execute(command, out)
    }

    fn print_coroutine_record(&self, coroutine: &Coroutine, out: &mut dyn Write) -> Result<()> {
        let types = self.host.types();
        let ty = lookup_type(types, &self.layout.coroutine_type)?;
        let record = RemoteValue::new(coroutine.address, ty, types);
        writeln!(out, "({} *) 0x{:x}", record.type_name(), record.address())?;
        writeln!(out, "{}", self.format_value(record)?)?;
        Ok(())
    }

    fn dump_list(
        &self,
        head: &str,
        element_type: &str,
        link_field: &str,
        field: Option<&str>,
        out: &mut dyn Write,
    ) -> Result<()> {
        let types = self.host.types();
        let element = lookup_type(types, element_type)?;
        let walker = ListWalker::new(types, element, link_field, &self.layout.next_field)?;
        if let Some(field) = field {
            field_offset(types, element, field)?;
        }

        let head = self.evaluate_address(head)?;
        let elements = walker.walk(self.host.memory(), head, ListBound::UntilHead { limit: DUMP_LIST_LIMIT })?;

        for (i, value) in elements.iter().enumerate() {
            match field {
                Some(field) => {
                    let projected = value.field(field)?;
                    writeln!(out, "[{}] {} = {}", i, field, self.format_value(projected)?)?;
                }
                None => {
                    writeln!(
                        out,
                        "[{}] ({} *) 0x{:x} = {}",
                        i,
                        value.type_name(),
                        value.address(),
                        self.format_value(*value)?
                    )?;
                }
            }
        }
        writeln!(out, "Total: {}", elements.len())?;
        Ok(())
    }
}

fn print_help(out: &mut dyn Write) -> Result<()> {
    writeln!(
        out,
        "\
Available commands:

  help                          - Show this help message
  quit/exit/q                   - Exit the debugger

Inspection commands:
  backtrace (bt) [N]            - Show the call stack of the selected thread
  frame (f) [N]                 - Select or show a stack frame
  registers (info registers)    - Show the registers of the selected frame
  print (p) <expr>              - Print a variable (name, name.field, name->field)
  info threads                  - List threads
  thread [ID|NAME]              - Select or show the current thread

Coroutine commands:
  coroutines [THREAD...]        - List coroutines of all or the given threads
  coroutine <THREAD> <ID> [CMD] - Run CMD inside a coroutine (no CMD: print its record)
  coroutine all [CMD]           - Run CMD inside every coroutine of every thread
  dump-list <ADDR> <TYPE> <LINK>
                                - Print every element of an intrusive list
  dump-list-field <ADDR> <TYPE> <LINK> <FIELD>
                                - Print one field of every element
  field-offset <TYPE> <FIELD>   - Print the byte offset of a field

Examples:
  coroutines worker
  coroutine 2 14 bt
  dump-list-field mm_self->scheduler.list_ready mm_coroutine link id"
    )?;
    Ok(())
}
