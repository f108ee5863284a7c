//! シェル全体の設定。
//!
//! 起動時に一度だけ組み立て、[`ShellContext`](crate::context::ShellContext) 経由で参照する。
//!
//! # 環境変数
//!
//! - `RUSH_REAP_MODE`: `thread`（既定）または `signal`
//! - `RUSH_JOB_CONTROL`: `all` / `interactive`（既定）/ `none`

use std::str::FromStr;

/// 子プロセスの回収方式。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReapMode {
    /// 専用スレッドがブロッキング `waitpid` を回す。
    #[default]
    Thread,
    /// `SIGCHLD` ハンドラはカウンタを進めるだけで、メインスレッドが回収する。
    Signal,
}

impl FromStr for ReapMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "signal" => Ok(Self::Signal),
            _ => Err(format!("unknown reap mode: '{}' (expected thread or signal)", s)),
        }
    }
}

/// どのジョブにジョブ制御（専用プロセスグループ）を与えるか。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobControl {
    All,
    #[default]
    Interactive,
    None,
}

impl FromStr for JobControl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "full" => Ok(Self::All),
            "interactive" => Ok(Self::Interactive),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unknown job control mode: '{}' (expected all, interactive or none)",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    /// 対話セッションか（端末に接続されているか）。
    pub interactive_session: bool,
    pub job_control: JobControl,
    pub reap_mode: ReapMode,
    /// 通知メッセージの接頭辞に使うプログラム名。
    pub program_name: String,
    /// 起動時に親プロセスの環境変数を取り込むか。
    pub import_environment: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        ShellConfig {
            interactive_session: false,
            job_control: JobControl::default(),
            reap_mode: ReapMode::default(),
            program_name: "rush".to_string(),
            import_environment: true,
        }
    }
}

impl ShellConfig {
    /// `RUSH_*` 環境変数で上書きする。不正な値は警告を出して無視する。
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup("RUSH_REAP_MODE") {
            match raw.parse() {
                Ok(mode) => self.reap_mode = mode,
                Err(e) => tracing::warn!("RUSH_REAP_MODE ignored: {}", e),
            }
        }
        if let Some(raw) = lookup("RUSH_JOB_CONTROL") {
            match raw.parse() {
                Ok(jc) => self.job_control = jc,
                Err(e) => tracing::warn!("RUSH_JOB_CONTROL ignored: {}", e),
            }
        }
        self
    }

    /// 現在の対話状態でジョブ制御を使うか。
    pub fn job_control_enabled(&self, interactive: bool) -> bool {
        match self.job_control {
            JobControl::All => true,
            JobControl::Interactive => interactive,
            JobControl::None => false,
        }
    }
}
