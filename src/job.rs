//! プロセス・ジョブのレコードとジョブリスト。
//!
//! [`Process`] はパイプラインの 1 段、[`Job`] はパイプライン全体に対応する。
//! ジョブはプロセス列を所有し、破棄時にジョブ ID をアロケータへ返す。
//! 状態の更新（`completed` / `stopped`）は回収経路（[`proc`](crate::proc)）からのみ行う。

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use libc::pid_t;

use crate::error::JobError;
use crate::io::IoChain;
use crate::job_id::{JobId, JobIdAllocator};

// ── プロセス ─────────────────────────────────────────────────────────

/// パイプライン段の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// fork/exec される外部コマンド。
    External,
    /// シェル内で実行されるビルトイン。
    Builtin,
    /// シェル関数の呼び出し。
    Function,
    /// `begin ... end` などのコマンドブロック。
    BlockNode,
    /// `exec` によるシェル自身の置き換え。
    Exec,
}

/// プロセス内で実行される段の完了通知。
///
/// 別スレッドで評価される段（[`Parser::eval_in_child`](crate::parser::Parser::eval_in_child)）は
/// 終了時に [`finish`](Self::finish) を呼び、待機側は [`is_done`](Self::is_done) を見る。
#[derive(Debug, Default)]
pub struct EmulatedProcess {
    done: AtomicBool,
    status: AtomicI32,
}

impl EmulatedProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// 終了ステータスを記録して完了にする。ステータスは完了フラグより先に書く。
    pub fn finish(&self, status: i32) {
        self.status.store(status, Ordering::Release);
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }
}

/// パイプラインの 1 段。
pub struct Process {
    pub argv: Vec<String>,
    /// 解決済みの実行ファイルパス（外部コマンドのみ）。
    pub actual_cmd: String,
    /// プロセス ID。fork 前は 0。
    pub pid: pid_t,
    /// 次段へ書き込む fd（なければ -1）。
    pub pipe_write_fd: RawFd,
    /// 前段から読み込む fd（なければ -1）。
    pub pipe_read_fd: RawFd,
    pub completed: bool,
    pub stopped: bool,
    /// `waitpid` が返した raw status。
    pub status: i32,
    pub kind: ProcessKind,
    pub eproc: Option<Arc<EmulatedProcess>>,
    /// この段だけに適用するリダイレクト。
    pub io: IoChain,
}

impl Process {
    pub fn new(argv: Vec<String>, kind: ProcessKind) -> Self {
        Process {
            argv,
            actual_cmd: String::new(),
            pid: 0,
            pipe_write_fd: -1,
            pipe_read_fd: -1,
            completed: false,
            stopped: false,
            status: 0,
            kind,
            eproc: None,
            io: IoChain::new(),
        }
    }

    /// 引数列の先頭（コマンド名）。
    pub fn name(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("argv", &self.argv)
            .field("pid", &self.pid)
            .field("kind", &self.kind)
            .field("completed", &self.completed)
            .field("stopped", &self.stopped)
            .field("status", &self.status)
            .finish()
    }
}

// ── ジョブ ───────────────────────────────────────────────────────────

/// ジョブフラグのビット集合。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFlags(u8);

impl JobFlags {
    /// 停止/終了をユーザに通知済み。
    pub const NOTIFIED: JobFlags = JobFlags(1 << 0);
    pub const FOREGROUND: JobFlags = JobFlags(1 << 1);
    /// 構築が完了し、すべての段が起動済み。
    pub const CONSTRUCTED: JobFlags = JobFlags(1 << 2);
    /// 終了・停止の通知を出さない。
    pub const SKIP_NOTIFICATION: JobFlags = JobFlags(1 << 3);
    /// 終了ステータスを反転する（`not`）。
    pub const NEGATE: JobFlags = JobFlags(1 << 4);
    /// 独自のプロセスグループを持ち、ジョブ制御の対象。
    pub const JOB_CONTROL: JobFlags = JobFlags(1 << 5);
    /// 実行中に端末を所有したい。
    pub const TERMINAL: JobFlags = JobFlags(1 << 6);

    pub fn contains(self, other: JobFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, flag: JobFlags, on: bool) {
        if on {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }
}

impl std::ops::BitOr for JobFlags {
    type Output = JobFlags;

    fn bitor(self, rhs: JobFlags) -> JobFlags {
        JobFlags(self.0 | rhs.0)
    }
}

/// パイプライン。プロセス列と、ブロック突入時に束縛された I/O を所有する。
pub struct Job {
    /// 表示用コマンド文字列。
    pub command: String,
    pub processes: Vec<Process>,
    /// プロセスグループ ID。最初の段の起動時に決まる。
    pub pgid: pid_t,
    /// 停止時に保存した端末属性。再開時に復元する。
    pub tmodes: Option<libc::termios>,
    pub flags: JobFlags,
    pub block_io: IoChain,
    id: JobId,
    ids: Arc<JobIdAllocator>,
}

impl Job {
    /// ジョブを作成し、ジョブ ID を確保する。
    pub fn new(command: impl Into<String>, ids: &Arc<JobIdAllocator>, block_io: IoChain) -> Self {
        let id = ids.acquire();
        Job {
            command: command.into(),
            processes: Vec::new(),
            pgid: 0,
            tmodes: None,
            flags: JobFlags::default(),
            block_io,
            id,
            ids: Arc::clone(ids),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn get_flag(&self, flag: JobFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: JobFlags, on: bool) {
        self.flags.set(flag, on);
    }

    pub fn is_foreground(&self) -> bool {
        self.get_flag(JobFlags::FOREGROUND)
    }

    /// 全段が完了または停止しているか。
    pub fn is_stopped(&self) -> bool {
        self.processes.iter().all(|p| p.completed || p.stopped)
    }

    /// 全段が完了しているか。
    pub fn is_completed(&self) -> bool {
        self.processes.iter().all(|p| p.completed)
    }

    /// 起動に失敗した段とそれ以降の段を完了扱いにする。有効な pid を持たないため回収されない。
    pub fn mark_process_as_failed(&mut self, index: usize) {
        for p in self.processes.iter_mut().skip(index) {
            p.completed = true;
        }
    }

    /// ジョブにシグナルを送る。
    ///
    /// ジョブが独自のプロセスグループを持てば `killpg`、シェルと同じグループなら
    /// 未完了の各段へ個別に `kill` する。
    pub fn signal(&self, sig: i32) -> Result<(), JobError> {
        let my_pgid = unsafe { libc::getpgrp() };
        if self.pgid != my_pgid && self.pgid > 0 {
            if unsafe { libc::killpg(self.pgid, sig) } != 0 {
                return Err(JobError::Signal {
                    call: "killpg",
                    signal: sig,
                    source: std::io::Error::last_os_error(),
                });
            }
            return Ok(());
        }
        let mut result = Ok(());
        for p in &self.processes {
            if !p.completed && p.pid > 0 && unsafe { libc::kill(p.pid, sig) } != 0 {
                result = Err(JobError::Signal {
                    call: "kill",
                    signal: sig,
                    source: std::io::Error::last_os_error(),
                });
            }
        }
        result
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.ids.release(self.id);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("pgid", &self.pgid)
            .field("flags", &self.flags)
            .field("processes", &self.processes)
            .finish()
    }
}

// ── ジョブリスト ─────────────────────────────────────────────────────

/// パーサーが所有するジョブ列。先頭が最も最近使われたジョブ。
#[derive(Debug, Default)]
pub struct JobList {
    jobs: Vec<Job>,
}

impl JobList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 先頭に追加する。
    pub fn add(&mut self, job: Job) {
        self.jobs.insert(0, job);
    }

    /// ジョブを先頭へ移す。見つからなければ `false`。
    pub fn promote(&mut self, id: JobId) -> bool {
        match self.jobs.iter().position(|j| j.id == id) {
            Some(0) => true,
            Some(idx) => {
                let job = self.jobs.remove(idx);
                self.jobs.insert(0, job);
                true
            }
            None => false,
        }
    }

    /// ジョブを取り外して返す。呼び出し側が破棄すると ID が解放される。
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let idx = self.jobs.iter().position(|j| j.id == id)?;
        Some(self.jobs.remove(idx))
    }

    /// ID でジョブを探す。`id <= 0` なら最も最近使われたジョブ。
    pub fn get(&self, id: JobId) -> Option<&Job> {
        if id <= 0 {
            return self.jobs.first();
        }
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        if id <= 0 {
            return self.jobs.first_mut();
        }
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    /// プロセスグループ ID でジョブを探す。
    pub fn get_from_pid(&self, pgid: pid_t) -> Option<&Job> {
        self.jobs.iter().find(|j| j.pgid == pgid)
    }

    /// pid を持つ段の位置 `(ジョブ添字, 段添字)` を返す。
    pub fn find_process(&self, pid: pid_t) -> Option<(usize, usize)> {
        self.jobs.iter().enumerate().find_map(|(ji, job)| {
            job.processes.iter().position(|p| p.pid == pid).map(|pi| (ji, pi))
        })
    }

    /// 未完了の全段の pid をリスト順に返す。
    pub fn pending_pids(&self) -> Vec<pid_t> {
        self.jobs
            .iter()
            .flat_map(|j| j.processes.iter())
            .filter(|p| p.pid > 0 && !p.completed)
            .map(|p| p.pid)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut()
    }

    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn at_mut(&mut self, idx: usize) -> &mut Job {
        &mut self.jobs[idx]
    }
}
