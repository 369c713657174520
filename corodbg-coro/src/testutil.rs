//! テスト用のメモリと、ランタイムに似た型テーブル
//!
//! `testutil` フィーチャーで他のクレートのテストからも使えます。

use corodbg_dwarf::{BaseEncoding, MemoryReader, TypeDesc, TypeId, TypeKind, TypeTable};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// バイト単位の疎なメモリ（読み取りを記録する）
#[derive(Default)]
pub struct MockMemory {
    data: HashMap<u64, u8>,
    pub reads: Cell<usize>,
    log: RefCell<Vec<(u64, usize)>>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// `[start, end)` に触れた読み取りがあったか
    pub fn touched(&self, start: u64, end: u64) -> bool {
        self.log
            .borrow()
            .iter()
            .any(|(addr, size)| *addr < end && addr.saturating_add(*size as u64) > start)
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.data.insert(addr + i as u64, *b);
        }
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }
}

impl MemoryReader for MockMemory {
    fn read_u8(&self, addr: usize) -> anyhow::Result<u8> {
        Ok(self.read(addr, 1)?[0])
    }

    fn read_u16(&self, addr: usize) -> anyhow::Result<u16> {
        let b = self.read(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&self, addr: usize) -> anyhow::Result<u32> {
        let b = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&self, addr: usize) -> anyhow::Result<u64> {
        let b = self.read(addr, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&b);
        Ok(u64::from_le_bytes(buf))
    }

    fn read(&self, addr: usize, size: usize) -> anyhow::Result<Vec<u8>> {
        self.reads.set(self.reads.get() + 1);
        self.log.borrow_mut().push((addr as u64, size));
        (0..size as u64)
            .map(|i| {
                self.data
                    .get(&(addr as u64).wrapping_add(i))
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("unmapped address 0x{:x}", (addr as u64).wrapping_add(i)))
            })
            .collect()
    }
}

/// mm_coroutine のフィールドオフセット
pub struct Offsets {
    pub id: u64,
    pub state: u64,
    pub errno: u64,
    pub function: u64,
    pub arg: u64,
    pub context: u64,
    pub link: u64,
    pub name: u64,
}

/// mm_scheduler のフィールドオフセット
pub struct SchedulerOffsets {
    pub current: u64,
    pub main: u64,
    pub count_ready: u64,
    pub list_ready: u64,
    pub count_active: u64,
    pub list_active: u64,
}

pub struct RuntimeTypes {
    pub types: TypeTable,
    pub coroutine: TypeId,
    pub coroutine_ptr: TypeId,
    pub machine_ptr: TypeId,
    pub list: TypeId,
    pub offsets: Offsets,
    pub sched: SchedulerOffsets,
    /// mm_machine 内の scheduler の位置
    pub machine_scheduler: u64,
}

pub const COROUTINE_SIZE: u64 = 80;

/// x86_64 の machinarium に相当する型を組み立てる
pub fn runtime_types() -> RuntimeTypes {
    let mut t = TypeTable::new(8);
    let u64_ty = t.add_base("long unsigned int", 8, BaseEncoding::Unsigned);
    let int_ty = t.add_base("int", 4, BaseEncoding::Signed);
    let ch = t.add_base("char", 1, BaseEncoding::SignedChar);
    let void_ptr = t.add_pointer(None);
    let void_ptr_ptr = t.add_pointer(Some(void_ptr));
    let func = t.add(TypeDesc::new(None, 0, TypeKind::Function));
    let func_ptr = t.add_pointer(Some(func));
    let function_t = t.add_typedef("mm_function_t", func_ptr);
    let state = t.add_enum(
        "mm_coroutinestate_t",
        4,
        &[("MM_CNEW", 0), ("MM_CREADY", 1), ("MM_CACTIVE", 2), ("MM_CFREE", 3)],
    );
    let name = t.add_array(ch, 16);

    let list = t.declare_struct("mm_list");
    let list_ptr = t.add_pointer(Some(list));
    t.define_struct(list, 16, &[("next", 0, list_ptr), ("prev", 8, list_ptr)]);
    let list_t = t.add_typedef("mm_list_t", list);

    let context = t.add_struct("mm_context", 8, &[("sp", 0, void_ptr_ptr)]);

    let offsets = Offsets {
        id: 0,
        state: 8,
        errno: 16,
        function: 24,
        arg: 32,
        context: 40,
        link: 48,
        name: 64,
    };
    let coroutine = t.declare_struct("mm_coroutine");
    let coroutine_ptr = t.add_pointer(Some(coroutine));
    t.define_struct(
        coroutine,
        COROUTINE_SIZE,
        &[
            ("id", offsets.id, u64_ty),
            ("state", offsets.state, state),
            ("cancel", 12, int_ty),
            ("errno_", offsets.errno, int_ty),
            ("function", offsets.function, function_t),
            ("function_arg", offsets.arg, void_ptr),
            ("context", offsets.context, context),
            ("link", offsets.link, list_t),
            ("name", offsets.name, name),
        ],
    );
    let coroutine_t = t.add_typedef("mm_coroutine_t", coroutine);
    let coroutine_t_ptr = t.add_pointer(Some(coroutine_t));

    let sched = SchedulerOffsets {
        current: 0,
        main: 8,
        count_ready: 88,
        list_ready: 96,
        count_active: 112,
        list_active: 120,
    };
    let scheduler = t.add_struct(
        "mm_scheduler",
        136,
        &[
            ("current", sched.current, coroutine_t_ptr),
            ("main", sched.main, coroutine_t),
            ("count_ready", sched.count_ready, int_ty),
            ("list_ready", sched.list_ready, list_t),
            ("count_active", sched.count_active, int_ty),
            ("list_active", sched.list_active, list_t),
        ],
    );
    let scheduler_t = t.add_typedef("mm_scheduler_t", scheduler);

    let machine_scheduler = 16;
    let machine = t.add_struct(
        "mm_machine",
        152,
        &[("online", 0, int_ty), ("id", 8, u64_ty), ("scheduler", machine_scheduler, scheduler_t)],
    );
    let machine_t = t.add_typedef("mm_machine_t", machine);
    let machine_ptr = t.add_pointer(Some(machine_t));

    RuntimeTypes {
        types: t,
        coroutine,
        coroutine_ptr,
        machine_ptr,
        list,
        offsets,
        sched,
        machine_scheduler,
    }
}

/// 1つのコルーチンレコードを書き込む
pub struct CoroutineRecord<'a> {
    pub id: u64,
    pub state: u32,
    pub errno: i32,
    pub function: u64,
    pub arg: u64,
    pub sp: u64,
    pub name: &'a str,
}

impl RuntimeTypes {
    pub fn write_coroutine(&self, mem: &mut MockMemory, addr: u64, rec: &CoroutineRecord<'_>) {
        mem.write(addr, &[0u8; COROUTINE_SIZE as usize]);
        mem.write_u64(addr + self.offsets.id, rec.id);
        mem.write_u32(addr + self.offsets.state, rec.state);
        mem.write(addr + self.offsets.errno, &rec.errno.to_le_bytes());
        mem.write_u64(addr + self.offsets.function, rec.function);
        mem.write_u64(addr + self.offsets.arg, rec.arg);
        mem.write_u64(addr + self.offsets.context, rec.sp);
        let mut name = [0u8; 16];
        name[..rec.name.len()].copy_from_slice(rec.name.as_bytes());
        mem.write(addr + self.offsets.name, &name);
    }

    /// 要素レコードのアドレス列から循環リストを張る（head は番兵）
    pub fn link(&self, mem: &mut MockMemory, head: u64, records: &[u64]) {
        let nodes: Vec<u64> = records.iter().map(|r| r + self.offsets.link).collect();
        let mut ring = vec![head];
        ring.extend(&nodes);
        for (i, node) in ring.iter().enumerate() {
            let next = ring[(i + 1) % ring.len()];
            let prev = ring[(i + ring.len() - 1) % ring.len()];
            mem.write_u64(*node, next);
            mem.write_u64(*node + 8, prev);
        }
    }

    /// mm_machine を書き込む（current は current_addr、リストは与えた順）
    pub fn write_machine(
        &self,
        mem: &mut MockMemory,
        machine: u64,
        current: u64,
        active: &[u64],
        ready: &[u64],
    ) {
        mem.write(machine, &[0u8; 152]);
        let sched = machine + self.machine_scheduler;
        mem.write_u64(sched + self.sched.current, current);
        mem.write_u32(sched + self.sched.count_active, active.len() as u32);
        mem.write_u32(sched + self.sched.count_ready, ready.len() as u32);
        self.link(mem, sched + self.sched.list_active, active);
        self.link(mem, sched + self.sched.list_ready, ready);
        self.write_coroutine(
            mem,
            sched + self.sched.main,
            &CoroutineRecord {
                id: u64::MAX,
                state: 2,
                errno: 0,
                function: 0,
                arg: 0,
                sp: 0,
                name: "",
            },
        );
    }
}
