//! 合成ターゲット
//!
//! 3スレッドのプロセスを模したホストです。
//!
//! * スレッド1 "odyssey": active = [1 (実行中), 2], ready = [3]
//! * スレッド2 "worker": `mm_self` が NULL
//! * スレッド3 "idle": current はスケジューラ内の main、active = [5]

#![allow(dead_code)]

use corodbg_coro::testutil::{runtime_types, CoroutineRecord, MockMemory, RuntimeTypes};
use corodbg_core::{TargetHost, VariableRef};
use corodbg_dwarf::{FrameRules, MemoryReader, SavedRule, TypeTable};
use corodbg_target::{RegisterSet, Thread, ThreadId};
use std::collections::HashMap;

pub const T1: ThreadId = 100;
pub const T2: ThreadId = 101;
pub const T3: ThreadId = 102;

pub const MACHINE1: u64 = 0x10000;
pub const MACHINE3: u64 = 0x11000;
pub const EMPTY_LIST: u64 = 0x31000;

pub const C1: u64 = 0x20000;
pub const C2: u64 = 0x20100;
pub const C3: u64 = 0x20200;
pub const C5: u64 = 0x20400;

/// コルーチン2の保存スタックポインタ
pub const S2: u64 = 0x60000;
pub const S3: u64 = 0x61000;
pub const S5: u64 = 0x63000;

pub const LINK_OFFSET: u64 = 48;

/// 合成ホスト
pub struct FakeHost {
    pub arch: String,
    pub threads: Vec<Thread>,
    pub registers: HashMap<ThreadId, RegisterSet>,
    pub memory: MockMemory,
    pub types: TypeTable,
    pub globals: HashMap<String, VariableRef>,
    pub thread_locals: HashMap<(ThreadId, String), VariableRef>,
    pub symbols: Vec<(u64, u64, &'static str)>,
}

impl TargetHost for FakeHost {
    fn arch_name(&self) -> &str {
        &self.arch
    }

    fn threads(&self) -> Vec<Thread> {
        self.threads.clone()
    }

    fn thread_registers(&self, tid: ThreadId) -> anyhow::Result<RegisterSet> {
        self.registers
            .get(&tid)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no registers for thread {}", tid))
    }

    fn memory(&self) -> &dyn MemoryReader {
        &self.memory
    }

    fn types(&self) -> &TypeTable {
        &self.types
    }

    fn variable(&self, tid: ThreadId, name: &str) -> anyhow::Result<Option<VariableRef>> {
        Ok(self
            .thread_locals
            .get(&(tid, name.to_string()))
            .or_else(|| self.globals.get(name))
            .copied())
    }

    fn symbolize(&self, address: u64) -> Option<String> {
        let (start, _, name) = self
            .symbols
            .iter()
            .find(|(start, size, _)| address >= *start && address < start + size)?;
        Some(match address - start {
            0 => name.to_string(),
            off => format!("{}+{}", name, off),
        })
    }

    fn source_line(&self, _address: u64) -> Option<String> {
        None
    }

    /// 0x401000..0x402000 の関数はすべて `push rbp` 直後の形
    fn frame_rules(&self, pc: u64) -> Option<FrameRules> {
        if !(0x401000..0x402000).contains(&pc) {
            return None;
        }
        Some(FrameRules {
            cfa_register: 7,
            cfa_offset: 16,
            rules: vec![(16, SavedRule::AtCfaOffset(-8)), (6, SavedRule::AtCfaOffset(-16))],
            return_address_register: 16,
        })
    }
}

fn write_coroutine(rt: &RuntimeTypes, mem: &mut MockMemory, addr: u64, id: u64, state: u32, errno: i32, sp: u64, name: &str) {
    rt.write_coroutine(
        mem,
        addr,
        &CoroutineRecord {
            id,
            state,
            errno,
            function: 0x401280,
            arg: 0x5000 + id,
            sp,
            name,
        },
    );
}

/// current を省略するとスケジューラ内の main が実行中になる
fn write_machine(rt: &RuntimeTypes, mem: &mut MockMemory, machine: u64, current: Option<u64>, active: &[u64], ready: &[u64]) {
    let main = machine + rt.machine_scheduler + rt.sched.main;
    rt.write_machine(mem, machine, current.unwrap_or(main), active, ready);
}

/// 保存領域（r15 r14 r13 r12 rbx rbp rip）とその上の1フレームを書く
fn write_saved_stack(mem: &mut MockMemory, sp: u64, rip: u64) {
    mem.write(sp, &[0u8; 0x100]);
    for (i, value) in [0xf15u64, 0xf14, 0xf13, 0xf12, 0xb0b, sp + 0x100, rip].iter().enumerate() {
        mem.write_u64(sp + i as u64 * 8, *value);
    }
    // 中断した関数のフレーム: [rsp] = 退避した rbp, [rsp+8] = 戻りアドレス
    mem.write_u64(sp + 56, sp + 0x200);
    mem.write_u64(sp + 64, 0x401310);
}

fn thread_registers(rip: u64, rsp: u64, rbp: u64) -> RegisterSet {
    [
        ("rax", 0),
        ("rbx", 0x1b),
        ("rsp", rsp),
        ("rbp", rbp),
        ("r12", 0x12),
        ("rip", rip),
        ("fs_base", 0x7fff_0000),
    ]
    .into_iter()
    .collect()
}

impl FakeHost {
    /// 3スレッドのシナリオ
    pub fn scenario() -> Self {
        let rt = runtime_types();
        assert_eq!(rt.offsets.link, LINK_OFFSET);
        let mut mem = MockMemory::new();

        write_coroutine(&rt, &mut mem, C1, 1, 2, 0, 0x62000, "acceptor");
        write_coroutine(&rt, &mut mem, C2, 2, 2, 4, S2, "client");
        write_coroutine(&rt, &mut mem, C3, 3, 1, 0, S3, "");
        write_coroutine(&rt, &mut mem, C5, 5, 2, 0, S5, "idle-task");
        write_saved_stack(&mut mem, S2, 0x401234);
        write_saved_stack(&mut mem, S3, 0x401240);
        write_saved_stack(&mut mem, S5, 0x401250);

        write_machine(&rt, &mut mem, MACHINE1, Some(C1), &[C1, C2], &[C3]);
        write_machine(&rt, &mut mem, MACHINE3, None, &[C5], &[]);
        rt.link(&mut mem, EMPTY_LIST, &[]);

        // スレッド1のスタック: mm_scheduler_main <- coroutine_entry
        mem.write(0x70000, &[0u8; 0x40]);
        mem.write_u64(0x70000, 0x70030);
        mem.write_u64(0x70008, 0x401300);

        let anchors = [(T1, 0x30000, MACHINE1), (T2, 0x30100, 0), (T3, 0x30200, MACHINE3)];
        let mut thread_locals = HashMap::new();
        for (tid, address, machine) in anchors {
            mem.write_u64(address, machine);
            thread_locals.insert(
                (tid, "mm_self".to_string()),
                VariableRef {
                    address,
                    ty: rt.machine_ptr,
                },
            );
        }

        let mut globals = HashMap::new();
        globals.insert(
            "empty_list".to_string(),
            VariableRef {
                address: EMPTY_LIST,
                ty: rt.list,
            },
        );

        let mut registers = HashMap::new();
        registers.insert(T1, thread_registers(0x401010, 0x70000, 0x70010));
        registers.insert(T2, thread_registers(0x500000, 0x71000, 0));
        registers.insert(T3, thread_registers(0x500010, 0x72000, 0));

        Self {
            arch: "x86_64".to_string(),
            threads: vec![
                Thread::new(T1, 1, "odyssey"),
                Thread::new(T2, 2, "worker"),
                Thread::new(T3, 3, "idle"),
            ],
            registers,
            memory: mem,
            types: rt.types,
            globals,
            thread_locals,
            symbols: vec![
                (0x401000, 0x100, "mm_scheduler_main"),
                (0x401200, 0x80, "worker_loop"),
                (0x401280, 0x180, "coroutine_entry"),
            ],
        }
    }

    /// ランタイムを使っていないプロセス
    pub fn without_runtime() -> Self {
        let mut host = Self::scenario();
        host.thread_locals.clear();
        host
    }
}
