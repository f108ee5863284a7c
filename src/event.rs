//! イベント発火。
//!
//! 変数変更・プロセス終了・ジョブ終了をスクリプト層のハンドラに通知する。
//! ハンドラの実体（関数呼び出し）はこのクレートの外にあり、[`EventSink`] 越しに渡す。
//! 発火はすべて env ロック・ジョブストアロックを解放した後に行う。

use std::sync::{Mutex, PoisonError};

/// イベントの種類。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// 変数の変更（`--on-variable NAME`）。
    Variable(String),
    /// プロセスまたはプロセスグループの終了（`--on-process-exit PID`）。
    /// プロセスグループは負の pgid で表す。
    Exit(libc::pid_t),
    /// ジョブの終了（`--on-job-exit ID`）。
    JobId(i32),
}

/// 発火するイベント。`args` はハンドラに渡す引数列。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub args: Vec<String>,
}

impl Event {
    /// 変数変更イベント。引数は `["VARIABLE", 操作名, 変数名]`。
    pub fn variable(op: &str, name: &str) -> Self {
        Event {
            kind: EventKind::Variable(name.to_string()),
            args: vec!["VARIABLE".to_string(), op.to_string(), name.to_string()],
        }
    }

    /// プロセス終了イベント。引数は `[メッセージ, pid, ステータス]`。
    pub fn process_exit(pid: libc::pid_t, status: i32) -> Self {
        Event {
            kind: EventKind::Exit(pid),
            args: vec!["PROCESS_EXIT".to_string(), pid.to_string(), status.to_string()],
        }
    }

    /// ジョブ終了イベント（pgid 指定）。`--on-process-exit -PGID` 用。
    pub fn job_exit_pgid(pgid: libc::pid_t) -> Self {
        Event {
            kind: EventKind::Exit(-pgid),
            args: vec!["JOB_EXIT".to_string(), (-pgid).to_string(), "0".to_string()],
        }
    }

    /// ジョブ終了イベント（ジョブ ID 指定）。
    pub fn job_exit_id(job_id: i32) -> Self {
        Event {
            kind: EventKind::JobId(job_id),
            args: vec!["JOB_EXIT".to_string(), job_id.to_string(), "0".to_string()],
        }
    }
}

impl Event {
    /// バックトレース用の説明文。
    pub fn description(&self) -> String {
        match &self.kind {
            EventKind::Variable(name) => format!("handler for variable '{}'", name),
            EventKind::Exit(pid) if *pid > 0 => format!("exit handler for process {}", pid),
            EventKind::Exit(pid) => format!("exit handler for job with process group {}", -pid),
            EventKind::JobId(id) => format!("exit handler for job {}", id),
        }
    }
}

/// イベントの受け手。
pub trait EventSink: Send + Sync {
    fn fire(&self, event: &Event);
}

/// 何もしないシンク。
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn fire(&self, event: &Event) {
        tracing::trace!(kind = ?event.kind, "event dropped (no handler)");
    }
}

/// 発火されたイベントを記録するシンク。
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 記録済みイベントを取り出して空にする。
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for RecordingSink {
    fn fire(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_exit_uses_negative_pgid() {
        let ev = Event::job_exit_pgid(4242);
        assert_eq!(ev.kind, EventKind::Exit(-4242));
        assert_eq!(ev.args, vec!["JOB_EXIT", "-4242", "0"]);
    }

    #[test]
    fn descriptions_name_the_target() {
        assert_eq!(Event::variable("SET", "PATH").description(), "handler for variable 'PATH'");
        assert_eq!(Event::process_exit(12, 0).description(), "exit handler for process 12");
        assert_eq!(
            Event::job_exit_pgid(40).description(),
            "exit handler for job with process group 40"
        );
        assert_eq!(Event::job_exit_id(3).description(), "exit handler for job 3");
    }

    #[test]
    fn recording_sink_drains() {
        let sink = RecordingSink::new();
        sink.fire(&Event::variable("SET", "PATH"));
        sink.fire(&Event::process_exit(7, -1));
        let got = sink.take();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].args, vec!["PROCESS_EXIT", "7", "-1"]);
        assert!(sink.take().is_empty());
    }
}
