//! ランタイムのデータ構造の名前
//!
//! オフセットは常に型情報から求めるので、ここには名前だけを置きます。

/// ランタイムを読むための変数名・型名・フィールド名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLayout {
    /// スレッドローカルな `mm_machine_t *` 変数
    pub anchor: String,
    pub scheduler_field: String,
    pub current_field: String,
    pub count_active_field: String,
    pub list_active_field: String,
    pub count_ready_field: String,
    pub list_ready_field: String,
    /// リンク型の次ポインタ
    pub next_field: String,
    pub coroutine_type: String,
    pub link_field: String,
    pub id_field: String,
    pub state_field: String,
    pub errno_field: String,
    pub function_field: String,
    /// 省略可能
    pub arg_field: String,
    /// 省略可能
    pub name_field: String,
    pub context_field: String,
    /// `context` 内の保存スタックポインタ
    pub sp_field: String,
}

impl Default for RuntimeLayout {
    fn default() -> Self {
        Self {
            anchor: "mm_self".into(),
            scheduler_field: "scheduler".into(),
            current_field: "current".into(),
            count_active_field: "count_active".into(),
            list_active_field: "list_active".into(),
            count_ready_field: "count_ready".into(),
            list_ready_field: "list_ready".into(),
            next_field: "next".into(),
            coroutine_type: "mm_coroutine".into(),
            link_field: "link".into(),
            id_field: "id".into(),
            state_field: "state".into(),
            errno_field: "errno_".into(),
            function_field: "function".into(),
            arg_field: "function_arg".into(),
            name_field: "name".into(),
            context_field: "context".into(),
            sp_field: "sp".into(),
        }
    }
}

impl RuntimeLayout {
    /// アンカー変数名を差し替える
    pub fn with_anchor(mut self, anchor: impl Into<String>) -> Self {
        self.anchor = anchor.into();
        self
    }

    /// コルーチン型名を差し替える（`struct ` 接頭辞は付いていてもよい）
    pub fn with_coroutine_type(mut self, ty: impl Into<String>) -> Self {
        self.coroutine_type = ty.into();
        self
    }
}
