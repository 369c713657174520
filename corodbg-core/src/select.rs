//! スレッド・コルーチンのセレクタ解決

use corodbg_coro::{Coroutine, CoroutineSet, InspectError};
use corodbg_target::Thread;

/// セレクタがスレッドに一致するか
///
/// 表示名、または番号の文字列表現と大文字小文字を区別して比較します。
pub fn thread_matches(thread: &Thread, selector: &str) -> bool {
    thread.name() == selector || thread.num().to_string() == selector
}

/// スレッドセレクタの解決結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSelection {
    /// 一致したスレッド（番号順、重複なし）
    pub threads: Vec<Thread>,
    /// どのスレッドにも一致しなかったセレクタ
    pub unmatched: Vec<String>,
}

/// セレクタの集合からスレッドを選ぶ
///
/// セレクタが空なら全スレッドです。
pub fn select_threads(threads: &[Thread], selectors: &[String]) -> ThreadSelection {
    if selectors.is_empty() {
        return ThreadSelection {
            threads: threads.to_vec(),
            unmatched: Vec::new(),
        };
    }

    let selected = threads
        .iter()
        .filter(|t| selectors.iter().any(|s| thread_matches(t, s)))
        .cloned()
        .collect();
    let unmatched = selectors
        .iter()
        .filter(|s| !threads.iter().any(|t| thread_matches(t, s)))
        .cloned()
        .collect();

    ThreadSelection {
        threads: selected,
        unmatched,
    }
}

/// 1つのスレッドを選ぶ（同名が複数あれば番号の小さいもの）
pub fn find_thread(threads: &[Thread], selector: &str) -> Result<Thread, InspectError> {
    threads
        .iter()
        .find(|t| thread_matches(t, selector))
        .cloned()
        .ok_or_else(|| InspectError::ThreadNotFound(selector.to_string()))
}

/// IDでコルーチンを選ぶ
pub fn find_coroutine<'a>(set: &'a CoroutineSet, thread: &Thread, id: u64) -> Result<&'a Coroutine, InspectError> {
    set.find(id).ok_or_else(|| InspectError::CoroutineNotFound {
        thread: thread.num().to_string(),
        id: id.to_string(),
    })
}
