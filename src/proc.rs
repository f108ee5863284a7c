//! ジョブ状態の伝播とフォアグラウンド制御。
//!
//! - [`handle_child_status`]: 回収したステータスを該当プロセスに反映する
//! - [`job_reap`]: 終了・停止したジョブのイベント発火と通知、完了ジョブの破棄
//! - [`job_continue`]: ジョブの再開、端末の受け渡し、フォアグラウンド待機
//!
//! ステータスの取得自体は [`JobStore`](crate::reaper::JobStore) が行い、
//! ここはパーサーのジョブリストに対して結果を適用する側。

use std::io;
use std::sync::Arc;
use std::time::Duration;

use libc::pid_t;

use crate::error::JobError;
use crate::event::Event;
use crate::io::{make_fd_blocking, IoBuffer};
use crate::job::{Job, JobFlags, JobList, Process, ProcessKind};
use crate::job_id::JobId;
use crate::parser::Parser;
use crate::reaper::WaitTimeout;

/// 通知に載せるコマンド文字列の最大幅。
const MAX_COMMAND_WIDTH: usize = 32;
const ELLIPSIS: char = '\u{2026}';

/// バッファ付きパイプを `select` で待つ時間。
const SELECT_TIMEOUT: Duration = Duration::from_millis(10);

// ── ステータスの反映 ─────────────────────────────────────────────────

/// `waitpid` の raw status をプロセスの停止/完了フラグに反映する。
pub fn mark_process_status(process: &mut Process, status: i32) {
    process.status = status;
    if libc::WIFSTOPPED(status) {
        process.stopped = true;
    } else if libc::WIFSIGNALED(status) || libc::WIFEXITED(status) {
        process.completed = true;
    } else {
        process.completed = true;
        tracing::warn!(pid = process.pid, status, "process exited abnormally");
    }
}

/// 子プロセス `pid` のステータス変化を処理する。
///
/// パイプラインの後段が終了したとき、前段がまだ動いていれば `SIGPIPE` を送る。
/// `SIGINT` / `SIGQUIT` による終了は、非対話ならシェル自身に同じシグナルを送り直し、
/// 対話なら評価中のブロックをすべて skip にする。
pub fn handle_child_status(parser: &mut Parser, pid: pid_t, status: i32) {
    let found = match parser.jobs.find_process(pid) {
        Some((ji, pi)) => {
            let job = parser.jobs.at_mut(ji);
            mark_process_status(&mut job.processes[pi], status);
            if job.processes[pi].completed && pi > 0 {
                let prev = &job.processes[pi - 1];
                if !prev.completed && prev.pid > 0 {
                    tracing::trace!(pid = prev.pid, "reader exited, sending SIGPIPE to writer");
                    unsafe { libc::kill(prev.pid, libc::SIGPIPE) };
                }
            }
            true
        }
        None => {
            tracing::debug!(pid, "status change for a process not tracked by any job");
            false
        }
    };

    if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        if sig == libc::SIGINT || sig == libc::SIGQUIT {
            if !parser.ctx().is_interactive_session() {
                reraise_with_default_disposition(sig);
            } else if found {
                parser.skip_all_blocks();
            }
        }
    }
}

/// `SIGINT` / `SIGQUIT` を既定の動作に戻し、自分自身に `sig` を送る。
fn reraise_with_default_disposition(sig: i32) {
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = 0;
        act.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGINT, &act, std::ptr::null_mut());
        libc::sigaction(libc::SIGQUIT, &act, std::ptr::null_mut());
        libc::kill(libc::getpid(), sig);
    }
}

/// ジョブストアから届いているステータスを反映する。
///
/// `wants_await` なら最初の 1 件が届くまで待つ。何か反映できたら `true`。
fn process_mark_finished_children(parser: &mut Parser, wants_await: bool) -> bool {
    let store = Arc::clone(&parser.ctx().job_store);
    let mut timeout = if wants_await { WaitTimeout::Forever } else { WaitTimeout::Poll };
    let mut processed = false;
    while let Some((pid, status)) = store.wait_for_job(&parser.jobs, timeout) {
        handle_child_status(parser, pid, status);
        processed = true;
        timeout = WaitTimeout::Poll;
    }
    processed
}

// ── 通知 ─────────────────────────────────────────────────────────────

/// コマンド文字列を通知用の幅に切り詰める。末尾の空白は省略記号の前で落とす。
pub fn truncate_command(cmd: &str) -> String {
    if cmd.chars().count() <= MAX_COMMAND_WIDTH {
        return cmd.to_string();
    }
    let mut truncated: String = cmd.chars().take(MAX_COMMAND_WIDTH - 1).collect();
    truncated.truncate(truncated.trim_end().len());
    truncated.push(ELLIPSIS);
    truncated
}

/// raw status をシェルの終了ステータスに変換する。シグナル終了は 128 + シグナル番号。
pub fn proc_format_status(status: i32) -> i32 {
    if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else {
        status
    }
}

/// `SIGTERM` のようなシグナル名。
pub fn signal_name(sig: i32) -> String {
    let name = match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGSYS => "SIGSYS",
        _ => return format!("SIG{}", sig),
    };
    name.to_string()
}

/// OS によるシグナルの説明文。
pub fn signal_description(sig: i32) -> String {
    let ptr = unsafe { libc::strsignal(sig) };
    if ptr.is_null() {
        return "Unknown".to_string();
    }
    unsafe { std::ffi::CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// `'cmd' has ended` 形式の通知。ジョブが複数あればジョブ番号を付ける。
pub fn format_job_info(job: &Job, status: &str, job_count: usize) -> String {
    if job_count == 1 {
        format!("'{}' has {}", truncate_command(&job.command), status)
    } else {
        format!("Job {}, '{}' has {}", job.id(), truncate_command(&job.command), status)
    }
}

/// シグナルによる終了の通知。
fn format_signal_notice(program: &str, job: &Job, process: &Process, job_count: usize) -> String {
    let sig = libc::WTERMSIG(process.status);
    let command = truncate_command(&job.command);
    if job.processes.len() == 1 {
        let job_desc = if job_count == 1 { String::new() } else { format!("Job {}, ", job.id()) };
        format!(
            "{}: {}'{}' terminated by signal {} ({})",
            program,
            job_desc,
            command,
            signal_name(sig),
            signal_description(sig)
        )
    } else {
        let job_desc =
            if job_count == 1 { String::new() } else { format!("from job {}, ", job.id()) };
        format!(
            "{}: Process {}, '{}' {}'{}' terminated by signal {} ({})",
            program,
            process.pid,
            process.name(),
            job_desc,
            command,
            signal_name(sig),
            signal_description(sig)
        )
    }
}

// ── 回収 ─────────────────────────────────────────────────────────────

/// 終了・停止したジョブを処理する。
///
/// 完了したプロセスごとに `PROCESS_EXIT` を、完了したジョブには `JOB_EXIT` を
/// pgid 版とジョブ ID 版の 2 回発火し、ジョブをリストから外す。
/// シグナル終了・バックグラウンドジョブの終了・新たな停止はユーザに通知する。
/// イベントハンドラが `$status` を変えうるので、前後で保存・復元する。
///
/// 再入しない。何か通知を出したら `true`。
pub fn job_reap(parser: &mut Parser, interactive: bool) -> bool {
    if parser.reaping {
        return false;
    }
    parser.reaping = true;

    process_mark_finished_children(parser, false);

    let saved_status = parser.last_status();
    let program = parser.ctx().config.program_name.clone();
    let job_count = parser.jobs.len();
    let mut found = false;
    let mut finished: Vec<JobId> = Vec::new();

    for job in parser.jobs.iter_mut() {
        let skip_notification = job.get_flag(JobFlags::SKIP_NOTIFICATION);
        if !skip_notification && !interactive && !job.is_foreground() {
            continue;
        }

        for idx in 0..job.processes.len() {
            let p = &job.processes[idx];
            if !p.completed || p.pid == 0 {
                continue;
            }
            let s = p.status;
            let reported = if libc::WIFSIGNALED(s) { -1 } else { libc::WEXITSTATUS(s) };
            parser.vars.fire_event(&Event::process_exit(p.pid, reported));

            // SIGPIPE は前段を止めるために自分で送ったもの
            if !libc::WIFSIGNALED(s) || libc::WTERMSIG(s) == libc::SIGPIPE {
                continue;
            }
            if job.processes.len() == 1 {
                job.set_flag(JobFlags::NOTIFIED, true);
            }
            if !skip_notification {
                // フォアグラウンドの ^C は見ればわかるので黙る
                if libc::WTERMSIG(s) != libc::SIGINT || !job.is_foreground() {
                    println!("{}", format_signal_notice(&program, job, &job.processes[idx], job_count));
                }
                found = true;
            }
            job.processes[idx].status = 0;
        }

        if job.is_completed() {
            if !job.is_foreground()
                && !job.get_flag(JobFlags::NOTIFIED)
                && !skip_notification
            {
                println!("{}", format_job_info(job, "ended", job_count));
                found = true;
            }
            parser.vars.fire_event(&Event::job_exit_pgid(job.pgid));
            parser.vars.fire_event(&Event::job_exit_id(job.id()));
            finished.push(job.id());
        } else if job.is_stopped() && !job.get_flag(JobFlags::NOTIFIED) {
            if !skip_notification {
                println!("{}", format_job_info(job, "stopped", job_count));
                found = true;
            }
            job.set_flag(JobFlags::NOTIFIED, true);
        }
    }

    for id in finished {
        tracing::debug!(job_id = id, "job finished");
        parser.job_remove(id);
    }

    parser.set_last_status(saved_status);
    parser.reaping = false;
    found
}

// ── 継続と端末 ───────────────────────────────────────────────────────

/// スコープの間すべてのシグナルをブロックする。
struct SignalBlock {
    previous: libc::sigset_t,
}

impl SignalBlock {
    fn new() -> Self {
        unsafe {
            let mut all: libc::sigset_t = std::mem::zeroed();
            let mut previous: libc::sigset_t = std::mem::zeroed();
            libc::sigfillset(&mut all);
            libc::sigprocmask(libc::SIG_BLOCK, &all, &mut previous);
            SignalBlock { previous }
        }
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

/// 端末をジョブのプロセスグループに渡す。停止からの再開なら保存した端末属性も戻す。
fn terminal_give_to_job(job: &Job, cont: bool) -> Result<(), JobError> {
    if unsafe { libc::tcsetpgrp(libc::STDIN_FILENO, job.pgid) } != 0 {
        return Err(JobError::TerminalTransfer {
            job_id: job.id(),
            command: job.command.clone(),
            source: io::Error::last_os_error(),
        });
    }
    if cont {
        if let Some(tmodes) = &job.tmodes {
            if unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSADRAIN, tmodes) } != 0 {
                return Err(JobError::TerminalAttributes {
                    job_id: job.id(),
                    source: io::Error::last_os_error(),
                });
            }
        }
    }
    Ok(())
}

/// 端末をシェルに戻し、次の再開のためにジョブの端末属性を保存する。
fn terminal_return_from_job(job: &mut Job) -> Result<(), JobError> {
    if unsafe { libc::tcsetpgrp(libc::STDIN_FILENO, libc::getpgrp()) } != 0 {
        return Err(JobError::TerminalReturn(io::Error::last_os_error()));
    }
    let mut tmodes: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut tmodes) } != 0 {
        return Err(JobError::TerminalReturn(io::Error::last_os_error()));
    }
    job.tmodes = Some(tmodes);
    Ok(())
}

/// ジョブに関わるリダイレクトのうちバッファ型のもの。
fn job_buffers(job: &Job) -> Vec<Arc<IoBuffer>> {
    job.block_io
        .buffers()
        .chain(job.processes.iter().flat_map(|p| p.io.buffers()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectResult {
    Ready,
    Timeout,
    NoBuffers,
}

/// ジョブのバッファ付きパイプを短時間 `select` で待つ。
fn select_try(job: &Job) -> SelectResult {
    let buffers = job_buffers(job);
    if buffers.is_empty() {
        return SelectResult::NoBuffers;
    }
    unsafe {
        let mut fds: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut fds);
        let mut maxfd = -1;
        for buf in &buffers {
            let fd = buf.read_fd();
            libc::FD_SET(fd, &mut fds);
            maxfd = maxfd.max(fd);
        }
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: SELECT_TIMEOUT.as_micros() as libc::suseconds_t,
        };
        let ret = libc::select(
            maxfd + 1,
            &mut fds,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut tv,
        );
        if ret > 0 {
            SelectResult::Ready
        } else {
            if ret == 0 {
                tracing::trace!("select_try hit timeout");
            }
            SelectResult::Timeout
        }
    }
}

/// 最後のバッファから読めるだけ読む。
fn read_try(job: &Job) {
    if let Some(buf) = job_buffers(job).last() {
        if let Err(e) = buf.read_available() {
            tracing::warn!(command = %job.command, "error while reading output from code block: {}", e);
        }
    }
}

/// ジョブを再開する。
///
/// ジョブをリストの先頭に移し、端末を所有するフォアグラウンドジョブなら端末を渡す。
/// `cont` なら `SIGCONT` を送る。フォアグラウンドなら停止か完了まで待ち、
/// 完了時は最後の段のステータスを `$status` に反映して端末をシェルに戻す。
///
/// OS 呼び出しの失敗はそのステップで打ち切り、エラーとして返す。
pub fn job_continue(parser: &mut Parser, job_id: JobId, cont: bool) -> Result<(), JobError> {
    parser.job_promote(job_id);
    let Some(job) = parser.jobs.get_mut(job_id) else {
        return Ok(());
    };
    job.set_flag(JobFlags::NOTIFIED, false);

    let foreground = job.is_foreground();
    let owns_terminal = job.get_flag(JobFlags::TERMINAL) && foreground;
    tracing::debug!(
        job_id,
        pgid = job.pgid,
        command = %job.command,
        completed = job.is_completed(),
        "continue job"
    );

    if !job.is_completed() {
        if owns_terminal {
            if let Err(e) = make_fd_blocking(libc::STDIN_FILENO) {
                tracing::debug!("could not make stdin blocking: {}", e);
            }
            let _blocked = SignalBlock::new();
            terminal_give_to_job(job, cont)?;
        }

        if cont {
            send_continue(job)?;
        }

        if foreground {
            process_mark_finished_children(parser, false);
            wait_for_foreground(parser, job_id);
        }
    }

    if !foreground {
        return Ok(());
    }
    let Some(job) = parser.jobs.get_mut(job_id) else {
        return Ok(());
    };

    if job.is_completed() {
        // 終了後に書かれた出力を取りこぼさない
        read_try(job);
        if let Some(last) = job.processes.last() {
            let s = last.status;
            if (libc::WIFEXITED(s) || libc::WIFSIGNALED(s)) && last.pid != 0 {
                let status = proc_format_status(s);
                let status = if job.get_flag(JobFlags::NEGATE) { (status == 0) as i32 } else { status };
                parser.vars.set_last_status(status);
            }
        }
    }

    if owns_terminal {
        let _blocked = SignalBlock::new();
        terminal_return_from_job(job)?;
    }
    Ok(())
}

/// 停止フラグを落として `SIGCONT` を送る。
fn send_continue(job: &mut Job) -> Result<(), JobError> {
    for p in job.processes.iter_mut() {
        p.stopped = false;
    }
    if job.get_flag(JobFlags::JOB_CONTROL) {
        if unsafe { libc::killpg(job.pgid, libc::SIGCONT) } != 0 {
            return Err(JobError::Signal {
                call: "killpg",
                signal: libc::SIGCONT,
                source: io::Error::last_os_error(),
            });
        }
        return Ok(());
    }
    for p in &job.processes {
        if p.pid > 0 && unsafe { libc::kill(p.pid, libc::SIGCONT) } < 0 {
            return Err(JobError::Signal {
                call: "kill",
                signal: libc::SIGCONT,
                source: io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

/// ジョブが停止か完了するまで待つ。バッファ付きパイプがあれば読みながら待つ。
fn wait_for_foreground(parser: &mut Parser, job_id: JobId) {
    loop {
        let Some(job) = parser.jobs.get(job_id) else {
            return;
        };
        if job.is_stopped() || job.is_completed() {
            return;
        }
        match select_try(job) {
            SelectResult::Ready => {
                read_try(job);
                process_mark_finished_children(parser, false);
            }
            SelectResult::Timeout => {
                process_mark_finished_children(parser, false);
            }
            SelectResult::NoBuffers => {
                // 待機が中断された、または回収できる子がいない
                if !process_mark_finished_children(parser, true) {
                    tracing::debug!(job_id, "foreground wait abandoned");
                    return;
                }
            }
        }
    }
}

// ── 整合性検査 ───────────────────────────────────────────────────────

/// ジョブリストの整合性を検査する。問題があれば警告して `false`。
pub fn proc_sanity_check(jobs: &JobList) -> bool {
    let mut ok = true;
    let mut fg_job: Option<&Job> = None;
    for job in jobs.iter() {
        if !job.get_flag(JobFlags::CONSTRUCTED) {
            continue;
        }
        if job.is_foreground() && !(job.is_stopped() || job.is_completed()) {
            if let Some(first) = fg_job {
                tracing::warn!(
                    "more than one job in foreground: job 1: '{}' job 2: '{}'",
                    first.command,
                    job.command
                );
                ok = false;
            }
            fg_job = Some(job);
        }
        for p in &job.processes {
            // ブロックノードは引数を持たない
            if p.argv.is_empty() && p.kind != ProcessKind::BlockNode {
                tracing::warn!(command = %job.command, "process has an empty argument list");
                ok = false;
            }
        }
    }
    ok
}
