//! 合成ターゲットに対するコマンドセッションのテスト

mod common;

use common::*;
use corodbg_core::{Flow, Focus, InspectError, Session};

fn session() -> Session<FakeHost> {
    Session::new(FakeHost::scenario())
}

fn run(session: &mut Session<FakeHost>, line: &str) -> String {
    let mut out = Vec::new();
    let flow = session.execute(line, &mut out).unwrap();
    assert_eq!(flow, Flow::Continue);
    String::from_utf8(out).unwrap()
}

fn run_err(session: &mut Session<FakeHost>, line: &str) -> anyhow::Error {
    let mut out = Vec::new();
    session.execute(line, &mut out).unwrap_err()
}

/// スレッド見出しの後に続くコルーチン行
fn coroutine_lines<'a>(output: &'a str, thread_header: &str) -> Vec<&'a str> {
    output
        .lines()
        .skip_while(|l| !l.starts_with(thread_header))
        .skip(2)
        .take_while(|l| !l.is_empty())
        .collect()
}

#[test]
fn test_dump_list_reports_every_element_and_count() {
    let mut s = session();
    let active = MACHINE1 + 16 + 120;
    let out = run(&mut s, &format!("dump-list 0x{:x} mm_coroutine link", active));

    let elements: Vec<&str> = out.lines().filter(|l| l.starts_with('[')).collect();
    assert_eq!(elements.len(), 2);
    assert!(elements[0].starts_with(&format!("[0] (struct mm_coroutine *) 0x{:x} = {{", C1)));
    assert!(elements[1].starts_with(&format!("[1] (struct mm_coroutine *) 0x{:x} = {{", C2)));
    assert!(out.contains("  name = \"client\""));
    assert!(out.ends_with("Total: 2\n"));
}

#[test]
fn test_dump_list_field_through_variable_path() {
    let mut s = session();
    let out = run(&mut s, "dump-list-field mm_self->scheduler.list_ready mm_coroutine link id");
    assert_eq!(out, "[0] id = 3\nTotal: 1\n");

    let out = run(&mut s, "dump-list-field mm_self.scheduler.list_active mm_coroutine link state");
    assert_eq!(out, "[0] state = MM_CACTIVE\n[1] state = MM_CACTIVE\nTotal: 2\n");
}

#[test]
fn test_dump_list_empty() {
    let mut s = session();
    assert_eq!(run(&mut s, "dump-list empty_list mm_coroutine link"), "Total: 0\n");
    assert_eq!(
        run(&mut s, &format!("dump-list-field 0x{:x} mm_coroutine link id", EMPTY_LIST)),
        "Total: 0\n"
    );
}

#[test]
fn test_dump_list_recovers_record_from_link() {
    let mut s = session();
    let ready = MACHINE1 + 16 + 96;
    let out = run(&mut s, &format!("dump-list 0x{:x} mm_coroutine link", ready));
    // リンクは C3 + 48 を指すが、表示されるのはレコードの先頭
    assert!(out.starts_with(&format!("[0] (struct mm_coroutine *) 0x{:x} = {{\n", C3)));
    assert!(out.contains("  id = 3,\n"));
    assert!(!out.contains(&format!("0x{:x}", C3 + LINK_OFFSET)));
}

#[test]
fn test_dump_list_errors() {
    let mut s = session();
    let err = run_err(&mut s, "dump-list 0x1000 mm_coroutine lnk");
    assert_eq!(err.to_string(), "There is no member named lnk in struct mm_coroutine");

    let err = run_err(&mut s, "dump-list 0x1000 mm_nothing link");
    assert!(matches!(err.downcast_ref::<InspectError>(), Some(InspectError::TypeNotFound(_))));

    let err = run_err(&mut s, "dump-list no_such_list mm_coroutine link");
    assert_eq!(err.to_string(), "No symbol \"no_such_list\" in current context");
}

#[test]
fn test_list_coroutines_is_union_with_single_marker() {
    let mut s = session();
    let out = run(&mut s, "coroutines");

    let lines = coroutine_lines(&out, "Thread 1 (odyssey)");
    let ids: Vec<&str> = lines
        .iter()
        .map(|l| l[1..].split('\t').next().unwrap_or_default())
        .collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(lines.iter().filter(|l| l.starts_with('*')).count(), 1);
    assert_eq!(
        lines[0],
        "*1\tMM_CACTIVE\t0\t0x401280 <coroutine_entry>\targ=0x5001\t\"acceptor\""
    );
    assert_eq!(lines[1], " 2\tMM_CACTIVE\t4\t0x401280 <coroutine_entry>\targ=0x5002\t\"client\"");
    assert_eq!(lines[2], " 3\tMM_CREADY\t0\t0x401280 <coroutine_entry>\targ=0x5003");

    assert!(out.contains("Thread 2 (worker) coroutines:\n mm_self is NULL"));

    // 実行中なのはスケジューラ内の main なので、どの行にも印は付かない
    let idle = coroutine_lines(&out, "Thread 3 (idle)");
    assert_eq!(idle.len(), 1);
    assert!(idle[0].starts_with(" 5\t"));
}

#[test]
fn test_list_coroutines_selectors() {
    let mut s = session();
    let focus = s.focus();
    let out = run(&mut s, "coroutines nonexistent-thread 3");
    assert!(out.starts_with("No such thread: nonexistent-thread\n"));
    assert!(out.contains("Thread 3 (idle) coroutines:"));
    assert!(!out.contains("Thread 1 (odyssey)"));
    assert_eq!(s.focus(), focus);

    let out = run(&mut s, "info coroutines Odyssey");
    assert_eq!(out, "No such thread: Odyssey\n");
}

#[test]
fn test_list_coroutines_without_runtime() {
    let mut s = Session::new(FakeHost::without_runtime());
    let out = run(&mut s, "coroutines odyssey");
    assert!(out.contains("There is no mm_self in the current context"));
}

#[test]
fn test_backtrace_in_coroutine() {
    let mut s = session();
    assert_eq!(
        run(&mut s, "bt"),
        "#0  0x0000000000401010 in mm_scheduler_main+16\n#1  0x0000000000401300 in coroutine_entry+128\n"
    );

    let out = run(&mut s, "coroutine odyssey 2 bt");
    assert_eq!(
        out,
        "#0  0x0000000000401234 in worker_loop+52\n#1  0x0000000000401310 in coroutine_entry+144\n"
    );
    assert!(!s.bridge().is_armed());
    assert!(!s.frame_filter().is_enabled());

    // 差し込みは次のコマンドに残らない
    assert_eq!(run(&mut s, "bt 1"), "#0  0x0000000000401010 in mm_scheduler_main+16\n(More stack frames follow...)\n");
}

#[test]
fn test_arming_is_idempotent_and_restores_focus() {
    let mut s = session();
    run(&mut s, "frame 1");
    let before = s.focus();
    assert_eq!(before, Focus { thread: Some(T1), frame: 1 });

    let first = run(&mut s, "coroutine 1 2 registers");
    assert_eq!(s.focus(), before);
    let second = run(&mut s, "coroutine odyssey 2 registers");
    assert_eq!(s.focus(), before);

    assert_eq!(first, second);
    assert!(first.starts_with("rip      0x0000000000401234"));
    assert!(first.contains(&format!("rsp      0x{:016x}", S2 + 56)));
    assert!(first.contains("rbx      0x0000000000000b0b"));
    assert!(!s.bridge().is_armed());

    assert_eq!(run(&mut s, "frame"), "#1  0x0000000000401300 in coroutine_entry+128\n");
}

#[test]
fn test_failed_inner_command_disarms_bridge() {
    let mut s = session();
    let before = s.focus();

    // 巻き戻しを伴わない内側のコマンドが失敗しても、武装は残らない
    let err = run_err(&mut s, "coroutine idle 5 print no_such_variable");
    assert_eq!(err.to_string(), "No symbol \"no_such_variable\" in current context");
    assert!(!s.bridge().is_armed());
    assert!(!s.frame_filter().is_enabled());
    assert_eq!(s.focus(), before);

    // 後続の無関係な巻き戻しはスレッド自身のフレームを見る
    run(&mut s, "thread 3");
    assert_eq!(run(&mut s, "bt"), "#0  0x0000000000500010\n");
}

#[test]
fn test_inner_thread_switch_is_undone() {
    let mut s = session();
    let out = run(&mut s, "coroutine odyssey 2 thread idle");
    assert_eq!(out, "[Switching to 3 (Thread 102 \"idle\")]\n");
    assert_eq!(s.focus(), Focus { thread: Some(T1), frame: 0 });
}

#[test]
fn test_running_coroutine_uses_thread_frames() {
    let mut s = session();
    let out = run(&mut s, "coroutine odyssey 1 bt 1");
    assert!(out.starts_with("#0  0x0000000000401010 in mm_scheduler_main+16\n"));
    // 実行中のコルーチンの保存領域は読まない
    assert!(!s.host().memory.touched(0x62000, 0x62100));
}

#[test]
fn test_empty_command_prints_record() {
    let mut s = session();
    let out = run(&mut s, "coroutine odyssey 3");
    assert!(out.starts_with(&format!("(struct mm_coroutine *) 0x{:x}\n{{\n", C3)));
    assert!(out.contains("  id = 3,\n"));
    assert!(out.contains("  state = MM_CREADY,\n"));
    assert!(out.contains("  function = 0x401280 <coroutine_entry>,\n"));
}

#[test]
fn test_run_in_every_coroutine() {
    let mut s = session();
    let before = s.focus();
    let out = run(&mut s, "coroutine all bt 1");

    let headers: Vec<&str> = out.lines().filter(|l| l.starts_with("Thread ")).collect();
    assert_eq!(
        headers,
        vec![
            "Thread 1 (odyssey) coroutine 1:",
            "Thread 1 (odyssey) coroutine 2:",
            "Thread 1 (odyssey) coroutine 3:",
            "Thread 3 (idle) coroutine 5:",
        ]
    );
    assert!(out.contains("#0  0x0000000000401234 in worker_loop+52"));
    assert!(out.contains("#0  0x0000000000401240 in worker_loop+64"));
    assert!(out.contains("#0  0x0000000000401250 in worker_loop+80"));
    assert_eq!(s.focus(), before);
    assert!(!s.bridge().is_armed());
}

#[test]
fn test_selector_errors() {
    let mut s = session();
    let err = run_err(&mut s, "coroutine odyssey 9999");
    assert_eq!(err.to_string(), "No such coroutine: 9999 (thread 1)");
    assert!(matches!(
        err.downcast_ref::<InspectError>(),
        Some(InspectError::CoroutineNotFound { .. })
    ));

    let err = run_err(&mut s, "coroutine ghost 1 bt");
    assert_eq!(err.to_string(), "No such thread: ghost");

    // セッションは継続する
    assert!(run(&mut s, "coroutines 1").contains("Thread 1 (odyssey)"));
}

#[test]
fn test_unsupported_architecture_is_rejected_before_reading_context() {
    let mut host = FakeHost::scenario();
    host.arch = "aarch64".to_string();
    let mut s = Session::new(host);
    let before = s.focus();

    let err = run_err(&mut s, "coroutine odyssey 2 registers");
    assert!(matches!(
        err.downcast_ref::<InspectError>(),
        Some(InspectError::UnsupportedArchitecture(arch)) if arch == "aarch64"
    ));
    assert!(!s.host().memory.touched(S2, S2 + 0x100));
    assert!(!s.bridge().is_armed());
    assert_eq!(s.focus(), before);

    // 列挙にはアーキテクチャは関係しない
    assert!(run(&mut s, "coroutines odyssey").contains(" 2\tMM_CACTIVE"));
}

#[test]
fn test_field_offset() {
    let mut s = session();
    assert_eq!(run(&mut s, "field-offset mm_coroutine link"), "48\n");
    assert_eq!(run(&mut s, "field-offset mm_scheduler list_active"), "120\n");
    assert_eq!(run(&mut s, "field-offset mm_machine_t scheduler"), "16\n");

    let err = run_err(&mut s, "field-offset mm_coroutine nope");
    assert_eq!(err.to_string(), "There is no member named nope in struct mm_coroutine");
}

#[test]
fn test_print_and_threads() {
    let mut s = session();
    assert_eq!(run(&mut s, "print mm_self"), format!("mm_self = 0x{:x}\n", MACHINE1));
    assert_eq!(run(&mut s, "p mm_self->scheduler.count_active"), "mm_self->scheduler.count_active = 2\n");

    run(&mut s, "thread worker");
    assert_eq!(run(&mut s, "print mm_self"), "mm_self = 0x0\n");
    let err = run_err(&mut s, "print mm_self->scheduler");
    assert!(err.to_string().contains("NULL"));

    let out = run(&mut s, "info threads");
    assert!(out.contains("* 2    Thread 101 \"worker\""));
    assert!(out.contains("  1    Thread 100 \"odyssey\""));
    assert_eq!(run(&mut s, "thread"), "[Current thread is 2 (Thread 101 \"worker\")]\n");
}

#[test]
fn test_quit_and_unknown_commands() {
    let mut s = session();
    let mut out = Vec::new();
    assert_eq!(s.execute("quit", &mut out).unwrap(), Flow::Quit);
    assert_eq!(s.execute("", &mut out).unwrap(), Flow::Continue);
    assert!(s.execute("frobnicate", &mut out).is_err());
}

#[test]
fn test_running_coroutine_inside_another_coroutine_sees_thread_frames() {
    let mut s = session();
    let direct = run(&mut s, "coroutine odyssey 1 bt 1");

    // 外側の差し込みは内側の実行中コルーチンに届かない
    let nested = run(&mut s, "coroutine odyssey 2 coroutine odyssey 1 bt 1");
    assert_eq!(nested, direct);
    assert!(nested.starts_with("#0  0x0000000000401010 in mm_scheduler_main+16\n"));

    // 別スレッドのコルーチンから入れ子にしても同じ
    let nested = run(&mut s, "coroutine idle 5 coroutine odyssey 1 bt 1");
    assert_eq!(nested, direct);
    assert!(!s.bridge().is_armed());
    assert!(!s.frame_filter().is_enabled());
}

#[test]
fn test_scheduler_main_record_is_readable_but_not_listed() {
    let mut s = session();
    run(&mut s, "thread idle");
    assert_eq!(
        run(&mut s, "print mm_self->scheduler.main.id"),
        "mm_self->scheduler.main.id = 18446744073709551615\n"
    );
    let out = run(&mut s, "coroutines idle");
    assert!(!out.contains("18446744073709551615"));
    assert!(!out.contains('*'));
}

#[test]
fn test_frame_pointer_at_top_of_address_space_ends_backtrace() {
    let mut host = FakeHost::scenario();
    let top = u64::MAX - 8;
    host.memory.write_u64(top, 0x1234);
    if let Some(regs) = host.registers.get_mut(&T3) {
        regs.set("rbp", top);
    }
    let mut s = Session::new(host);
    run(&mut s, "thread 3");
    assert_eq!(run(&mut s, "bt"), "#0  0x0000000000500010\n");
}
