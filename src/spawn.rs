//! `posix_spawnp()` の安全な Rust ラッパー。
//!
//! ## 構成
//!
//! | 型 | 役割 |
//! |-----|------|
//! | [`SpawnAttr`] | `posix_spawnattr_t` の RAII ラッパー（プロセスグループ、シグナル設定） |
//! | [`FileActions`] | `posix_spawn_file_actions_t` の RAII ラッパー（fd 操作） |
//! | [`CStringVec`] | argv/envp 用の NULL 終端ポインタ配列 |
//! | [`spawn`] | 上記を組み合わせて `posix_spawnp` を呼ぶ公開関数 |
//!
//! 環境はシェルのエクスポート配列（[`EnvStack::exported_environment`](crate::env::EnvStack::exported_environment)）
//! をそのまま `envp` に渡す。プロセスの `environ` は使わない。

use std::ffi::{CStr, CString};
use std::os::fd::RawFd;

use libc::pid_t;

use crate::error::SpawnError;
use crate::io::{IoChain, IoMode};

// ── SpawnAttr ─────────────────────────────────────────────────────

/// `posix_spawnattr_t` の RAII ラッパー。Drop で自動 destroy。
struct SpawnAttr {
    inner: libc::posix_spawnattr_t,
}

impl SpawnAttr {
    fn new() -> Self {
        unsafe {
            let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
            libc::posix_spawnattr_init(&mut attr);
            Self { inner: attr }
        }
    }

    fn add_flags(&mut self, flag: libc::c_int) {
        unsafe {
            let mut flags: libc::c_short = 0;
            libc::posix_spawnattr_getflags(&self.inner, &mut flags);
            flags |= flag as libc::c_short;
            libc::posix_spawnattr_setflags(&mut self.inner, flags);
        }
    }

    /// 子プロセスのプロセスグループを `pgid` にする。`0` なら子がグループリーダー。
    fn set_pgroup(&mut self, pgid: pid_t) {
        self.add_flags(libc::POSIX_SPAWN_SETPGROUP);
        unsafe {
            libc::posix_spawnattr_setpgroup(&mut self.inner, pgid);
        }
    }

    /// シェルが無視・捕捉しているシグナルを子で `SIG_DFL` に戻し、シグナルマスクを空にする。
    fn reset_signals(&mut self) {
        self.add_flags(libc::POSIX_SPAWN_SETSIGDEF | libc::POSIX_SPAWN_SETSIGMASK);
        unsafe {
            let mut sigset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sigset);
            for sig in [
                libc::SIGINT,
                libc::SIGQUIT,
                libc::SIGTSTP,
                libc::SIGTTOU,
                libc::SIGTTIN,
                libc::SIGCHLD,
                libc::SIGPIPE,
            ] {
                libc::sigaddset(&mut sigset, sig);
            }
            libc::posix_spawnattr_setsigdefault(&mut self.inner, &sigset);

            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            libc::posix_spawnattr_setsigmask(&mut self.inner, &empty);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawnattr_t {
        &self.inner
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.inner);
        }
    }
}

// ── FileActions ───────────────────────────────────────────────────

/// `posix_spawn_file_actions_t` の RAII ラッパー。Drop で自動 destroy。
struct FileActions {
    inner: libc::posix_spawn_file_actions_t,
}

impl FileActions {
    fn new() -> Self {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            libc::posix_spawn_file_actions_init(&mut actions);
            Self { inner: actions }
        }
    }

    /// `dup2(fd, newfd)` アクションを追加する。
    fn add_dup2(&mut self, fd: RawFd, newfd: RawFd) {
        unsafe {
            libc::posix_spawn_file_actions_adddup2(&mut self.inner, fd, newfd);
        }
    }

    fn add_close(&mut self, fd: RawFd) {
        unsafe {
            libc::posix_spawn_file_actions_addclose(&mut self.inner, fd);
        }
    }

    /// `open(path, flags, 0666)` の結果を `fd` に置くアクションを追加する。
    fn add_open(&mut self, fd: RawFd, path: &CStr, flags: i32) {
        unsafe {
            libc::posix_spawn_file_actions_addopen(&mut self.inner, fd, path.as_ptr(), flags, 0o666);
        }
    }

    fn as_ptr(&self) -> *const libc::posix_spawn_file_actions_t {
        &self.inner
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.inner);
        }
    }
}

// ── CStringVec ────────────────────────────────────────────────────

/// argv/envp 用の NULL 終端ポインタ配列。指す先の `CString` を借用して保持する。
struct CStringVec<'a> {
    _strings: std::borrow::Cow<'a, [CString]>,
    ptrs: Vec<*mut libc::c_char>,
}

impl CStringVec<'static> {
    /// 引数リストから構築する。NUL を含む引数は起動できないので `EINVAL` を返す。
    fn from_args(args: &[String]) -> Result<Self, SpawnError> {
        let strings = args
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SpawnError::Exec {
                errno: libc::EINVAL,
                command: args.first().cloned().unwrap_or_default(),
            })?;
        Ok(CStringVec::build(std::borrow::Cow::Owned(strings)))
    }
}

impl<'a> CStringVec<'a> {
    /// 既存の `CString` 列（エクスポート配列）を借用する。
    fn borrowed(strings: &'a [CString]) -> Self {
        CStringVec::build(std::borrow::Cow::Borrowed(strings))
    }

    fn build(strings: std::borrow::Cow<'a, [CString]>) -> Self {
        let mut ptrs: Vec<*mut libc::c_char> = strings
            .iter()
            .map(|s| s.as_ptr() as *mut libc::c_char)
            .collect();
        ptrs.push(std::ptr::null_mut());
        CStringVec { _strings: strings, ptrs }
    }

    fn as_ptr(&self) -> *const *mut libc::c_char {
        self.ptrs.as_ptr()
    }
}

// ── spawn 関数 ────────────────────────────────────────────────────

/// 起動要求。
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    /// コマンドと引数。`argv[0]` は PATH 検索される。
    pub argv: &'a [String],
    /// `Some(pgid)` なら子をそのプロセスグループに入れる（`0` なら新しいグループ）。
    /// `None` ならシェルのグループに残す。
    pub pgid: Option<pid_t>,
    /// パイプ入力（前段の読み出し端）。
    pub stdin_fd: Option<RawFd>,
    /// パイプ出力（次段の書き込み端）。
    pub stdout_fd: Option<RawFd>,
    /// 子で閉じる fd（パイプの未使用端など）。
    pub fds_to_close: &'a [RawFd],
    /// ジョブ全体のリダイレクト。パイプ接続より先に適用する。
    pub block_io: &'a IoChain,
    /// この段のリダイレクト。パイプ接続の後に適用する。
    pub io: &'a IoChain,
    pub envp: &'a [CString],
}

/// リダイレクトをファイルアクションに変換する。
fn apply_io_chain(actions: &mut FileActions, io: &IoChain) -> Result<(), SpawnError> {
    for data in io.iter() {
        match &data.mode {
            IoMode::File { path, flags } => {
                let cpath = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
                    SpawnError::Exec { errno: libc::EINVAL, command: path.display().to_string() }
                })?;
                actions.add_open(data.fd, &cpath, *flags);
            }
            IoMode::Fd { old_fd } => actions.add_dup2(*old_fd, data.fd),
            IoMode::Close => actions.add_close(data.fd),
            IoMode::Buffer(buf) => match buf.write_fd() {
                Some(fd) => actions.add_dup2(fd, data.fd),
                None => tracing::warn!(fd = data.fd, "output buffer already closed"),
            },
        }
    }
    Ok(())
}

/// `posix_spawnp` で子プロセスを起動し、子 PID を返す。
pub fn spawn(req: &SpawnRequest<'_>) -> Result<pid_t, SpawnError> {
    if req.argv.is_empty() {
        return Err(SpawnError::Exec { errno: libc::EINVAL, command: String::new() });
    }
    let argv = CStringVec::from_args(req.argv)?;
    let envp = CStringVec::borrowed(req.envp);

    let mut attr = SpawnAttr::new();
    if let Some(pgid) = req.pgid {
        attr.set_pgroup(pgid);
    }
    attr.reset_signals();

    let mut actions = FileActions::new();
    apply_io_chain(&mut actions, req.block_io)?;
    if let Some(fd) = req.stdin_fd {
        actions.add_dup2(fd, libc::STDIN_FILENO);
        if fd != libc::STDIN_FILENO {
            actions.add_close(fd);
        }
    }
    if let Some(fd) = req.stdout_fd {
        actions.add_dup2(fd, libc::STDOUT_FILENO);
        if fd != libc::STDOUT_FILENO {
            actions.add_close(fd);
        }
    }
    for &fd in req.fds_to_close {
        // dup2 で既に close 済みの fd を再 close しない
        if req.stdin_fd != Some(fd) && req.stdout_fd != Some(fd) {
            actions.add_close(fd);
        }
    }
    apply_io_chain(&mut actions, req.io)?;

    let mut pid: pid_t = 0;
    let ret = unsafe {
        libc::posix_spawnp(
            &mut pid,
            argv.as_ptr().read() as *const libc::c_char,
            actions.as_ptr(),
            attr.as_ptr(),
            argv.as_ptr(),
            envp.as_ptr(),
        )
    };

    if ret != 0 {
        return Err(SpawnError::Exec { errno: ret, command: req.argv[0].clone() });
    }
    tracing::trace!(pid, command = %req.argv[0], "spawned");
    Ok(pid)
}
