//! 実行ブロック。
//!
//! `while` / `for` / 関数呼び出しなど、評価中の構文単位を 1 つずつ表す。
//! ブロックの積み降ろしと変数スコープの対応付けは [`Parser`](crate::parser::Parser) が行う。

use crate::event::Event;

/// ブロックの種類と種類ごとの付加情報。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    While,
    For,
    If,
    /// 関数定義。本体は記録されるだけで実行されない。
    FunctionDef,
    /// 関数呼び出し。`shadows` なら呼び出し元のローカル変数を隠す。
    FunctionCall {
        name: String,
        args: Vec<String>,
        shadows: bool,
    },
    Switch,
    /// 実行されないブロック。
    Fake,
    /// トップレベル。
    Top,
    /// コマンド置換。
    Subst,
    Begin,
    /// `.` / `source` で読み込んだファイル。
    Source { file: String },
    /// イベントハンドラの実行。
    Event { event: Event },
    Breakpoint,
}

impl BlockKind {
    /// 関数呼び出しブロック。
    pub fn function_call(name: impl Into<String>, args: Vec<String>, shadows: bool) -> Self {
        BlockKind::FunctionCall { name: name.into(), args, shadows }
    }

    /// このブロックを作るビルトイン名。
    pub fn builtin_name(&self) -> Option<&'static str> {
        match self {
            BlockKind::While => Some("while"),
            BlockKind::For => Some("for"),
            BlockKind::If => Some("if"),
            BlockKind::FunctionDef => Some("function"),
            BlockKind::Switch => Some("switch"),
            BlockKind::Begin => Some("begin"),
            BlockKind::Source { .. } => Some("."),
            BlockKind::Breakpoint => Some("breakpoint"),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BlockKind::While => "'while' block",
            BlockKind::For => "'for' block",
            BlockKind::If => "'if' conditional block",
            BlockKind::FunctionDef => "function definition block",
            BlockKind::FunctionCall { shadows: true, .. } => "function invocation block",
            BlockKind::FunctionCall { shadows: false, .. } => {
                "function invocation block with no variable shadowing"
            }
            BlockKind::Switch => "'switch' block",
            BlockKind::Fake => "unexecutable block",
            BlockKind::Top => "global root block",
            BlockKind::Subst => "command substitution block",
            BlockKind::Begin => "'begin' unconditional block",
            BlockKind::Source { .. } => "Block created by the . builtin",
            BlockKind::Event { .. } => "event handler block",
            BlockKind::Breakpoint => "Block created by breakpoint",
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, BlockKind::FunctionCall { .. })
    }

    /// 積むときに新しい変数スコープが要るか。
    pub(crate) fn wants_env_scope(&self) -> bool {
        !matches!(self, BlockKind::FunctionDef | BlockKind::Fake | BlockKind::Top)
    }

    /// 変数スコープを境界（関数呼び出し相当）にするか。
    pub(crate) fn opens_new_scope(&self) -> bool {
        matches!(self, BlockKind::FunctionCall { shadows: true, .. })
    }
}

/// ループ制御の状態。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoopStatus {
    #[default]
    Normal,
    Break,
    Continue,
}

/// ブロックスタックの 1 要素。
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    /// 本体の評価を飛ばすか。
    pub skip: bool,
    pub loop_status: LoopStatus,
    /// 積まれた時点の行番号（不明なら -1）。
    pub src_lineno: i32,
    pub src_filename: Option<String>,
    /// 積んだときに変数スコープも積んだか。
    pub(crate) wants_pop_env: bool,
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Block {
            kind,
            skip: false,
            loop_status: LoopStatus::Normal,
            src_lineno: -1,
            src_filename: None,
            wants_pop_env: false,
        }
    }

    pub fn description(&self) -> &'static str {
        self.kind.description()
    }

    pub fn wants_pop_env(&self) -> bool {
        self.wants_pop_env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_call_descriptions_depend_on_shadowing() {
        let shadow = BlockKind::function_call("f", vec![], true);
        let plain = BlockKind::function_call("f", vec![], false);
        assert_eq!(shadow.description(), "function invocation block");
        assert_eq!(
            plain.description(),
            "function invocation block with no variable shadowing"
        );
        assert!(shadow.opens_new_scope());
        assert!(!plain.opens_new_scope());
    }

    #[test]
    fn scope_requirements() {
        assert!(!BlockKind::Top.wants_env_scope());
        assert!(!BlockKind::Fake.wants_env_scope());
        assert!(!BlockKind::FunctionDef.wants_env_scope());
        assert!(BlockKind::Subst.wants_env_scope());
        assert!(BlockKind::Source { file: "x".into() }.wants_env_scope());
        assert!(!BlockKind::While.opens_new_scope());
    }

    #[test]
    fn builtin_names() {
        assert_eq!(BlockKind::Source { file: "x".into() }.builtin_name(), Some("."));
        assert_eq!(BlockKind::Top.builtin_name(), None);
        assert_eq!(Block::new(BlockKind::While).loop_status, LoopStatus::Normal);
    }
}
