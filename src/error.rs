//! エラー型。
//!
//! 変数操作（[`EnvError`]）、ジョブ継続時の OS 呼び出し失敗（[`JobError`]）、
//! 外部コマンド起動失敗（[`SpawnError`]）、コマンド行の構文エラー（[`SyntaxError`]）を区別する。
//! いずれもシェルを落とさず、呼び出し元（スクリプト評価器）が診断を出す。

use thiserror::Error;

/// 変数の設定・削除の失敗。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// ユーザ操作で読み取り専用変数を変更しようとした。
    #[error("{0}: variable is read-only")]
    Permission(String),
    /// 読み取り専用/electric 変数をローカル・ユニバーサルに置こうとした、
    /// または electric 変数の export 状態を変えようとした。
    #[error("{0}: variable cannot be set in this scope")]
    Scope(String),
    /// 特殊変数に不正な値を設定しようとした（`umask` など）。
    #[error("{0}: invalid value")]
    Invalid(String),
    /// 削除対象の変数が存在しない。
    #[error("{0}: no such variable")]
    NotFound(String),
}

impl EnvError {
    /// ログ・メトリクス用の短いラベル。
    pub fn as_label(&self) -> &'static str {
        match self {
            EnvError::Permission(_) => "env_permission",
            EnvError::Scope(_) => "env_scope",
            EnvError::Invalid(_) => "env_invalid",
            EnvError::NotFound(_) => "env_not_found",
        }
    }
}

/// ジョブ継続・ターミナル受け渡しでの OS 呼び出し失敗。
///
/// 該当ステップを中断するだけで、シェルは動作を続ける。
#[derive(Debug, Error)]
pub enum JobError {
    /// `tcsetpgrp` の失敗。
    #[error("could not send job {job_id} ('{command}') to foreground: {source}")]
    TerminalTransfer {
        job_id: i32,
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// `tcsetattr` / `tcgetattr` の失敗。
    #[error("could not restore terminal modes for job {job_id}: {source}")]
    TerminalAttributes {
        job_id: i32,
        #[source]
        source: std::io::Error,
    },
    /// シェルをフォアグラウンドに戻せなかった。
    #[error("could not return shell to foreground: {0}")]
    TerminalReturn(#[source] std::io::Error),
    /// `kill` / `killpg` の失敗。
    #[error("{call} (signal {signal}) failed: {source}")]
    Signal {
        call: &'static str,
        signal: i32,
        #[source]
        source: std::io::Error,
    },
}

/// `posix_spawnp` の失敗を表すエラー。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpawnError {
    /// `posix_spawnp` 自体の失敗。errno 値とコマンド名を保持する。
    #[error("{command}: {}", errno_message(.errno))]
    Exec { errno: i32, command: String },
    /// パイプ作成の失敗。
    #[error("pipe: {0}")]
    Pipe(String),
    /// fork/exec で起動できない種類のプロセス（ビルトイン、関数など）。
    #[error("{0}: cannot be launched as an external process")]
    NotExternal(String),
}

/// コマンド行の構文エラー。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntaxError {
    #[error("unterminated quote")]
    UnterminatedQuote,
    /// `a | | b` や行頭の `|` など、空のパイプライン段。
    #[error("expected a command before '{0}'")]
    EmptyStage(char),
}

fn errno_message(errno: &i32) -> &'static str {
    match *errno {
        libc::ENOENT => "command not found",
        libc::EACCES => "permission denied",
        _ => "spawn failed",
    }
}

impl SpawnError {
    /// エラーに対応する終了ステータスを返す。
    /// 127 = command not found, 126 = permission denied, 1 = その他。
    pub fn exit_status(&self) -> i32 {
        match self {
            SpawnError::Exec { errno, .. } => match *errno {
                libc::ENOENT => 127,
                libc::EACCES => 126,
                _ => 1,
            },
            SpawnError::Pipe(_) => 1,
            SpawnError::NotExternal(_) => 125,
        }
    }
}
