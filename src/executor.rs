//! パイプラインの起動と、行単位の簡易評価器。
//!
//! - [`launch_job`]: 構築済みの [`Job`] の各段を `posix_spawnp` で起動し、パイプで接続して
//!   ジョブストアに登録する。フォアグラウンドなら [`job_continue`](crate::proc::job_continue) で待つ
//! - [`parse_line`]: 1 行を `;` / `&` で文、`|` で段、空白で単語に分ける
//! - [`PipelineEvaluator`]: 上記 2 つを組み合わせた [`Evaluator`] 実装
//!
//! 評価器が扱うのは外部コマンドのパイプラインだけで、制御構文・ビルトイン・関数はない。

use std::iter::Peekable;
use std::os::fd::RawFd;
use std::str::CharIndices;
use std::sync::Arc;

use crate::env::{EnvMode, ARRAY_SEP, ENV_NULL};
use crate::error::{SpawnError, SyntaxError};
use crate::io::IoChain;
use crate::job::{Job, JobFlags, Process, ProcessKind};
use crate::parser::{Evaluator, Parser};
use crate::proc;
use crate::spawn::{self, SpawnRequest};

// ── 起動 ─────────────────────────────────────────────────────────────

/// パイプを 1 本作る。両端に `FD_CLOEXEC` を立て、子には dup2 した fd だけが残る。
fn make_pipe() -> std::io::Result<[RawFd; 2]> {
    let mut fds = [-1; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    for fd in fds {
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
            let err = std::io::Error::last_os_error();
            close_pipe(&mut fds);
            return Err(err);
        }
    }
    Ok(fds)
}

fn close_fd(fd: &mut RawFd) {
    if *fd >= 0 {
        unsafe { libc::close(*fd) };
        *fd = -1;
    }
}

fn close_pipe(p: &mut [RawFd; 2]) {
    close_fd(&mut p[0]);
    close_fd(&mut p[1]);
}

/// ジョブを起動してジョブリストに登録し、`$status` を返す。
///
/// 1. ジョブ制御の有無で JOB_CONTROL / TERMINAL フラグとプロセスグループを決める
/// 2. 段数 - 1 本のパイプを作り、各段をエクスポート配列を `envp` にして起動する
/// 3. 起動した pid をジョブストアに通知する。起動に失敗した段以降は完了扱いにする
/// 4. フォアグラウンドなら `job_continue` で停止か完了まで待つ
///
/// どの段も起動できなかったジョブはリストに載せない。
pub fn launch_job(parser: &mut Parser, mut job: Job) -> i32 {
    let ctx = Arc::clone(parser.ctx());
    let job_control = ctx.config.job_control_enabled(parser.get_is_interactive());
    let foreground = job.is_foreground();
    let wants_terminal = job_control
        && foreground
        && ctx.is_interactive_session()
        && unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
    job.set_flag(JobFlags::JOB_CONTROL, job_control);
    job.set_flag(JobFlags::TERMINAL, wants_terminal);
    if !job_control {
        job.pgid = unsafe { libc::getpgrp() };
    }

    let envp = parser.vars().exported_environment();
    let n = job.processes.len();

    let mut pipes: Vec<[RawFd; 2]> = Vec::with_capacity(n.saturating_sub(1));
    for _ in 1..n {
        match make_pipe() {
            Ok(p) => pipes.push(p),
            Err(e) => {
                eprintln!("{}: pipe: {}", ctx.config.program_name, e);
                pipes.iter_mut().for_each(close_pipe);
                parser.set_last_status(SpawnError::Pipe(e.to_string()).exit_status());
                return parser.last_status();
            }
        }
    }

    let mut failure: Option<i32> = None;
    for i in 0..n {
        let stdin_fd = (i > 0).then(|| pipes[i - 1][0]);
        let stdout_fd = (i + 1 < n).then(|| pipes[i][1]);
        let fds_to_close: Vec<RawFd> = pipes
            .iter()
            .flatten()
            .copied()
            .filter(|&fd| fd >= 0 && Some(fd) != stdin_fd && Some(fd) != stdout_fd)
            .collect();
        let process = &job.processes[i];
        let result = if process.kind == ProcessKind::External {
            spawn::spawn(&SpawnRequest {
                argv: &process.argv,
                pgid: job_control.then_some(job.pgid),
                stdin_fd,
                stdout_fd,
                fds_to_close: &fds_to_close,
                block_io: &job.block_io,
                io: &process.io,
                envp: &envp,
            })
        } else {
            Err(SpawnError::NotExternal(process.name().to_string()))
        };

        match result {
            Ok(pid) => {
                if job_control {
                    if job.pgid == 0 {
                        job.pgid = pid;
                    }
                    // 子側の設定と競合しないよう親側でも設定する
                    unsafe { libc::setpgid(pid, job.pgid) };
                }
                let p = &mut job.processes[i];
                p.pid = pid;
                p.pipe_read_fd = stdin_fd.unwrap_or(-1);
                p.pipe_write_fd = stdout_fd.unwrap_or(-1);
                ctx.job_store.child_process_spawned(pid);
            }
            Err(e) => {
                eprintln!("{}: {}", ctx.config.program_name, e);
                failure = Some(e.exit_status());
                job.mark_process_as_failed(i);
                break;
            }
        }

        // 消費したパイプ端を親側で閉じる
        if i > 0 {
            close_fd(&mut pipes[i - 1][0]);
        }
        if i + 1 < n {
            close_fd(&mut pipes[i][1]);
        }
    }
    pipes.iter_mut().for_each(close_pipe);

    if job.processes.iter().all(|p| p.pid == 0) {
        tracing::debug!(command = %job.command, "no process of the job could be launched");
        parser.set_last_status(failure.unwrap_or(1));
        return parser.last_status();
    }

    job.set_flag(JobFlags::CONSTRUCTED, true);
    let id = job.id();
    if !foreground {
        if let Some(last) = job.processes.iter().rev().find(|p| p.pid > 0) {
            parser.last_bg_pid = last.pid;
        }
        if ctx.is_interactive_session() {
            eprintln!("[{}] {}", id, parser.last_bg_pid);
        }
    }
    tracing::debug!(job_id = id, pgid = job.pgid, command = %job.command, foreground, "job launched");
    parser.job_add(job);
    debug_assert!(proc::proc_sanity_check(parser.jobs()));

    if foreground {
        if let Err(e) = proc::job_continue(parser, id, false) {
            tracing::warn!("{}", e);
        }
    } else {
        parser.set_last_status(0);
    }
    if let Some(status) = failure {
        parser.set_last_status(status);
    }
    parser.last_status()
}

// ── 行の分割 ─────────────────────────────────────────────────────────

/// 1 つの文（パイプライン）。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSpec {
    /// 表示用のコマンド文字列（末尾の `&` は含まない）。
    pub text: String,
    pub stages: Vec<Vec<String>>,
    pub background: bool,
    /// `not` で始まる。
    pub negate: bool,
}

struct LineSplitter<'a, F> {
    line: &'a str,
    lookup: F,
    word: Option<String>,
    stage: Vec<String>,
    stages: Vec<Vec<String>>,
    /// 現在の文の開始位置（バイト）。
    start: usize,
    out: Vec<PipelineSpec>,
}

impl<'a, F: Fn(&str) -> Option<String>> LineSplitter<'a, F> {
    fn word(&mut self) -> &mut String {
        self.word.get_or_insert_with(String::new)
    }

    fn finish_word(&mut self) {
        if let Some(w) = self.word.take() {
            self.stage.push(w);
        }
    }

    fn finish_stage(&mut self, sep: char) -> Result<(), SyntaxError> {
        self.finish_word();
        if self.stage.is_empty() {
            return Err(SyntaxError::EmptyStage(sep));
        }
        self.stages.push(std::mem::take(&mut self.stage));
        Ok(())
    }

    fn finish_statement(&mut self, sep: char, end: usize, background: bool) -> Result<(), SyntaxError> {
        self.finish_word();
        if self.stage.is_empty() {
            if !self.stages.is_empty() || background {
                return Err(SyntaxError::EmptyStage(sep));
            }
            self.start = end + sep.len_utf8();
            return Ok(());
        }
        self.stages.push(std::mem::take(&mut self.stage));

        let mut stages = std::mem::take(&mut self.stages);
        let negate = stages[0].len() > 1 && stages[0][0] == "not";
        if negate {
            stages[0].remove(0);
        }
        self.out.push(PipelineSpec {
            text: self.line[self.start..end].trim().to_string(),
            stages,
            background,
            negate,
        });
        self.start = (end + sep.len_utf8()).min(self.line.len());
        Ok(())
    }

    /// `$NAME` を展開して現在の単語に追記する。配列は空白で連結する。
    fn expand_variable(&mut self, chars: &mut Peekable<CharIndices<'_>>) {
        let mut name = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            self.word().push('$');
            return;
        }
        let val = (self.lookup)(&name)
            .filter(|v| v != ENV_NULL)
            .map(|v| v.replace(ARRAY_SEP, " "))
            .unwrap_or_default();
        self.word().push_str(&val);
    }

    fn run(mut self) -> Result<Vec<PipelineSpec>, SyntaxError> {
        let line = self.line;
        let mut chars = line.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            match c {
                '\'' => {
                    self.word();
                    loop {
                        match chars.next() {
                            Some((_, '\'')) => break,
                            Some((_, ch)) => self.word().push(ch),
                            None => return Err(SyntaxError::UnterminatedQuote),
                        }
                    }
                }
                '"' => {
                    self.word();
                    loop {
                        match chars.next() {
                            Some((_, '"')) => break,
                            Some((_, '\\')) => match chars.next() {
                                Some((_, ch @ ('"' | '\\' | '$'))) => self.word().push(ch),
                                Some((_, ch)) => {
                                    self.word().push('\\');
                                    self.word().push(ch);
                                }
                                None => return Err(SyntaxError::UnterminatedQuote),
                            },
                            Some((_, '$')) => self.expand_variable(&mut chars),
                            Some((_, ch)) => self.word().push(ch),
                            None => return Err(SyntaxError::UnterminatedQuote),
                        }
                    }
                }
                '\\' => {
                    if let Some((_, ch)) = chars.next() {
                        self.word().push(ch);
                    }
                }
                '$' => self.expand_variable(&mut chars),
                '#' if self.word.is_none() => {
                    let end = idx;
                    self.finish_statement('\n', end, false)?;
                    return Ok(self.out);
                }
                '|' => self.finish_stage('|')?,
                ';' => self.finish_statement(';', idx, false)?,
                '&' => self.finish_statement('&', idx, true)?,
                c if c.is_whitespace() => self.finish_word(),
                c => self.word().push(c),
            }
        }
        let end = self.line.len();
        self.finish_statement('\n', end, false)?;
        Ok(self.out)
    }
}

/// 1 行を文の列に分ける。
///
/// クォート（`'...'` はそのまま、`"..."` は `$NAME` を展開）、`\` エスケープ、
/// 単語先頭の `#` 以降のコメントを扱う。`lookup` は変数の値を返す。
pub fn parse_line(
    line: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Vec<PipelineSpec>, SyntaxError> {
    LineSplitter {
        line,
        lookup,
        word: None,
        stage: Vec::new(),
        stages: Vec::new(),
        start: 0,
        out: Vec::new(),
    }
    .run()
}

// ── 評価器 ───────────────────────────────────────────────────────────

/// 外部コマンドのパイプラインだけを実行する評価器。
#[derive(Debug, Default)]
pub struct PipelineEvaluator;

impl PipelineEvaluator {
    fn run_pipeline(parser: &mut Parser, spec: PipelineSpec, io: &IoChain) -> i32 {
        let ids = Arc::clone(&parser.ctx().job_ids);
        let mut job = Job::new(spec.text, &ids, io.clone());
        job.processes = spec
            .stages
            .into_iter()
            .map(|argv| Process::new(argv, ProcessKind::External))
            .collect();
        job.set_flag(JobFlags::FOREGROUND, !spec.background);
        job.set_flag(JobFlags::NEGATE, spec.negate);
        launch_job(parser, job)
    }
}

impl Evaluator for PipelineEvaluator {
    fn eval(&self, parser: &mut Parser, src: &str, io: &IoChain) -> i32 {
        let mut status = parser.last_status();
        for (lineno, line) in src.lines().enumerate() {
            if parser.ctx().cancellation_requested() {
                break;
            }
            parser.set_lineno(Some(lineno as i32 + 1));
            let specs = match parse_line(line, |key| parser.vars().get(key, EnvMode::DEFAULT)) {
                Ok(specs) => specs,
                Err(e) => {
                    eprintln!("{}: line {}: {}", parser.ctx().config.program_name, lineno + 1, e);
                    status = 2;
                    parser.set_last_status(status);
                    continue;
                }
            };
            for spec in specs {
                if parser.current_block().is_some_and(|b| b.skip) {
                    break;
                }
                status = Self::run_pipeline(parser, spec, io);
            }
        }
        parser.set_lineno(None);
        status
    }
}
