//! デバッガコマンド

use thiserror::Error;

/// `coroutine` コマンドの対象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoroutineTarget {
    /// 全スレッドの全コルーチン
    All,
    /// スレッド（名前または番号）とコルーチンID
    One { thread: String, id: u64 },
}

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// バックトレース表示（上限フレーム数）
    Backtrace(Option<usize>),
    /// フレーム選択または表示
    Frame(Option<usize>),
    /// 選択フレームのレジスタ表示
    Registers,
    /// 変数表示
    Print(String),
    /// スレッド一覧
    InfoThreads,
    /// スレッド選択または表示
    Thread(Option<String>),
    /// コルーチン一覧（空なら全スレッド）
    ListCoroutines(Vec<String>),
    /// コルーチンの文脈でコマンドを実行する（空ならレコードを表示）
    RunInCoroutine { target: CoroutineTarget, command: String },
    /// 侵入型リストの要素を表示
    DumpList {
        head: String,
        element_type: String,
        link_field: String,
        /// 要素全体ではなくこのフィールドだけを表示
        field: Option<String>,
    },
    /// フィールドのオフセット表示
    FieldOffset { ty: String, field: String },
    /// ヘルプ表示
    Help,
    /// 終了
    Quit,
}

/// コマンドのパースエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Undefined command: \"{0}\".  Try \"help\".")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid number \"{0}\".")]
    InvalidNumber(String),
}

const COROUTINE_USAGE: &str = "coroutine <thread> <id> [command...] | coroutine all [command...]";
const DUMP_LIST_USAGE: &str = "dump-list <address> <type> <link-field>";
const DUMP_LIST_FIELD_USAGE: &str = "dump-list-field <address> <type> <link-field> <field>";
const FIELD_OFFSET_USAGE: &str = "field-offset <type> <field>";

impl Command {
    /// コマンド文字列をパースする
    ///
    /// 空行は `Ok(None)` です。
    pub fn parse(input: &str) -> Result<Option<Self>, ParseError> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        if parts.is_empty() {
            return Ok(None);
        }

        let command = match parts[0] {
            "backtrace" | "bt" | "where" => Command::Backtrace(parse_optional_number(parts.get(1))?),
            "frame" | "f" => Command::Frame(parse_optional_number(parts.get(1))?),
            "registers" | "regs" => Command::Registers,
            "print" | "p" => {
                if parts.len() < 2 {
                    return Err(ParseError::Usage("print <variable>"));
                }
                Command::Print(parts[1..].join(" "))
            }
            "thread" => Command::Thread(parts.get(1).map(|s| s.to_string())),
            "info" => match parts.get(1).copied() {
                Some("threads") => Command::InfoThreads,
                Some("registers") => Command::Registers,
                Some("frame") => Command::Frame(None),
                Some("coroutines") => Command::ListCoroutines(to_strings(&parts[2..])),
                _ => return Err(ParseError::Unknown(input.trim().to_string())),
            },
            "coroutines" | "list-coroutines" => Command::ListCoroutines(to_strings(&parts[1..])),
            "coroutine" | "run-in-coroutine" => parse_run_in_coroutine(input, &parts)?,
            "dump-list" => {
                if parts.len() != 4 {
                    return Err(ParseError::Usage(DUMP_LIST_USAGE));
                }
                Command::DumpList {
                    head: parts[1].to_string(),
                    element_type: parts[2].to_string(),
                    link_field: parts[3].to_string(),
                    field: None,
                }
            }
            "dump-list-field" => {
                if parts.len() != 5 {
                    return Err(ParseError::Usage(DUMP_LIST_FIELD_USAGE));
                }
                Command::DumpList {
                    head: parts[1].to_string(),
                    element_type: parts[2].to_string(),
                    link_field: parts[3].to_string(),
                    field: Some(parts[4].to_string()),
                }
            }
            "field-offset" => {
                if parts.len() != 3 {
                    return Err(ParseError::Usage(FIELD_OFFSET_USAGE));
                }
                Command::FieldOffset {
                    ty: parts[1].to_string(),
                    field: parts[2].to_string(),
                }
            }
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            _ => return Err(ParseError::Unknown(parts[0].to_string())),
        };

        Ok(Some(command))
    }
}

fn to_strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn parse_optional_number(arg: Option<&&str>) -> Result<Option<usize>, ParseError> {
    arg.map(|s| s.parse::<usize>().map_err(|_| ParseError::InvalidNumber(s.to_string())))
        .transpose()
}

/// 内側のコマンドは元の入力から切り出し、空白をそのまま渡す
fn parse_run_in_coroutine(input: &str, parts: &[&str]) -> Result<Command, ParseError> {
    let (target, consumed) = match parts.get(1).copied() {
        Some("all") => (CoroutineTarget::All, 2),
        Some(thread) => {
            let id = parts.get(2).ok_or(ParseError::Usage(COROUTINE_USAGE))?;
            let id = id
                .parse::<u64>()
                .map_err(|_| ParseError::InvalidNumber(id.to_string()))?;
            (
                CoroutineTarget::One {
                    thread: thread.to_string(),
                    id,
                },
                3,
            )
        }
        None => return Err(ParseError::Usage(COROUTINE_USAGE)),
    };

    Ok(Command::RunInCoroutine {
        target,
        command: skip_words(input, consumed).to_string(),
    })
}

/// 先頭から `n` 語を取り除いた残り
fn skip_words(input: &str, n: usize) -> &str {
    let mut rest = input.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = rest[end..].trim_start();
    }
    rest.trim_end()
}
