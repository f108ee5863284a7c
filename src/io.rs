//! I/O リダイレクトチェーン。
//!
//! ジョブのブロック I/O とプロセスごとのリダイレクトを [`IoChain`] で表す。
//! ジョブ制御が直接扱うのは [`IoBuffer`]（コマンド置換などの出力を貯めるパイプ）だけで、
//! フォアグラウンド待機中に `select` で監視し、読み出してバッファに溜める。

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// 読み出し 1 回あたりのバッファサイズ。
const READ_CHUNK: usize = 4096;

/// リダイレクトの種類。
#[derive(Debug)]
pub enum IoMode {
    /// ファイルへのリダイレクト（`> path` など）。
    File { path: PathBuf, flags: i32 },
    /// fd 複製（`2>&1` など）。`old_fd` を `fd` に dup2 する。
    Fd { old_fd: RawFd },
    /// fd を閉じる（`2>&-`）。
    Close,
    /// 出力をシェル内のバッファに貯める。
    Buffer(Arc<IoBuffer>),
}

/// 1 件のリダイレクト。`fd` は子プロセス側の fd 番号。
#[derive(Debug)]
pub struct IoData {
    pub fd: RawFd,
    pub mode: IoMode,
}

/// リダイレクトの並び。先頭から順に適用される。
#[derive(Debug, Default, Clone)]
pub struct IoChain(Vec<Arc<IoData>>);

impl IoChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: IoData) {
        self.0.push(Arc::new(data));
    }

    pub fn append(&mut self, other: &IoChain) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn iter(&self) -> impl Iterator<Item = &IoData> {
        self.0.iter().map(|d| d.as_ref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// チェーン内のバッファ型リダイレクトを順に返す。
    pub fn buffers(&self) -> impl Iterator<Item = &Arc<IoBuffer>> {
        self.0.iter().filter_map(|d| match &d.mode {
            IoMode::Buffer(buf) => Some(buf),
            _ => None,
        })
    }
}

/// 出力を貯めるパイプ。読み出し側はノンブロッキング。
#[derive(Debug)]
pub struct IoBuffer {
    read_end: OwnedFd,
    write_end: Mutex<Option<OwnedFd>>,
    out: Mutex<Vec<u8>>,
}

impl IoBuffer {
    /// パイプを作成する。両端に `FD_CLOEXEC`、読み出し側に `O_NONBLOCK` を立てる。
    pub fn create() -> io::Result<Arc<IoBuffer>> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // 所有権を先に移し、以降の失敗でも fd がリークしないようにする
        let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        for fd in [fds[0], fds[1]] {
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        set_nonblocking(fds[0])?;
        Ok(Arc::new(IoBuffer {
            read_end,
            write_end: Mutex::new(Some(write_end)),
            out: Mutex::new(Vec::new()),
        }))
    }

    /// 読み出し側の fd（`select` 用）。
    pub fn read_fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// 書き込み側の fd。子プロセスの起動後は [`close_write_end`](Self::close_write_end) で閉じる。
    pub fn write_fd(&self) -> Option<RawFd> {
        self.write_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|fd| fd.as_raw_fd())
    }

    /// シェル側の書き込み端を閉じる。子が終了すれば読み出し側で EOF を受け取れる。
    pub fn close_write_end(&self) {
        self.write_end.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// 読めるだけ読み出してバッファに追記する。EOF または `EAGAIN` で戻る。
    ///
    /// 戻り値は今回読み出したバイト数。
    pub fn read_available(&self) -> io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd(),
                    chunk.as_mut_ptr() as *mut libc::c_void,
                    chunk.len(),
                )
            };
            if n > 0 {
                let n = n as usize;
                self.out
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk[..n]);
                total += n;
                continue;
            }
            if n == 0 {
                return Ok(total);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(total),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// これまでに貯めた出力のコピー。
    pub fn contents(&self) -> Vec<u8> {
        self.out.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// fd に `O_NONBLOCK` を立てる。
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// fd から `O_NONBLOCK` を外す。フォアグラウンドジョブに stdin を渡す前に使う。
pub fn make_fd_blocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0
    {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
