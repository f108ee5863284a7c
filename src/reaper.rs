//! ジョブストア: 子プロセスの非同期回収。
//!
//! OS レベルの終了検出（`waitpid`）と、特定の pid の結果を受け取りたい待機側とを分離する。
//! 回収済みで未受領のステータスは pid → raw status のマップに置かれ、
//! その pid を待っている呼び出し元がちょうど 1 回だけ取り出す。
//!
//! 回収方式は 2 つ（[`ReapMode`]）:
//!
//! - `Thread`: 専用スレッドがロック外でブロッキング `waitpid(-1, WUNTRACED)` を回し、
//!   結果をマップに入れて条件変数をブロードキャストする。
//! - `Signal`: `SIGCHLD` ハンドラはアトミックカウンタを進めるだけ。
//!   待機側がジョブの pid ごとに `waitpid(WNOHANG)` を呼んで回収する。

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once, PoisonError};
use std::time::{Duration, Instant};

use libc::pid_t;

use crate::config::ReapMode;
use crate::job::{Job, JobList};

/// シグナル方式でカウンタを確認する間隔。
const SIGCHLD_POLL: Duration = Duration::from_millis(10);

/// `SIGCHLD` の受信回数。ハンドラが触るのはこのカウンタだけ。
static SIGCHLD_COUNT: AtomicU32 = AtomicU32::new(0);
static SIGCHLD_HANDLER: Once = Once::new();

extern "C" fn on_sigchld(_sig: libc::c_int) {
    SIGCHLD_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// `SIGCHLD` ハンドラを一度だけ登録する。
fn install_sigchld_handler() {
    SIGCHLD_HANDLER.call_once(|| unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = on_sigchld as extern "C" fn(libc::c_int) as usize;
        act.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut act.sa_mask);
        if libc::sigaction(libc::SIGCHLD, &act, std::ptr::null_mut()) != 0 {
            tracing::warn!("sigaction(SIGCHLD) failed: {}", io::Error::last_os_error());
        }
    });
}

/// これまでに受け取った `SIGCHLD` の回数。
pub fn sigchld_count() -> u32 {
    SIGCHLD_COUNT.load(Ordering::SeqCst)
}

/// 待機のタイムアウト指定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// 待たずに即座に戻る。
    Poll,
    /// 結果が得られるか中断されるまで待つ。
    Forever,
    /// 指定時間だけ待つ。
    After(Duration),
}

#[derive(Debug, Default)]
struct StoreState {
    /// 新しい子プロセスが起動されるたびに進む。
    generation: u64,
    reaper_active: bool,
    /// 回収済みで未受領のステータス。
    statuses: HashMap<pid_t, i32>,
    /// ジョブが取り外されたあとに終了する pid。届いたステータスは捨てる。
    forgotten: HashSet<pid_t>,
    /// [`JobStore::interrupt`] による中断要求。
    interrupted: bool,
}

/// プロセス全体で 1 つのジョブストア。
#[derive(Debug)]
pub struct JobStore {
    state: Mutex<StoreState>,
    cond: Condvar,
    mode: ReapMode,
}

impl JobStore {
    pub fn new(mode: ReapMode) -> Self {
        if mode == ReapMode::Signal {
            install_sigchld_handler();
        }
        JobStore {
            state: Mutex::new(StoreState::default()),
            cond: Condvar::new(),
            mode,
        }
    }

    pub fn mode(&self) -> ReapMode {
        self.mode
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 子プロセスの起動を通知する。スレッド方式で回収スレッドがいなければ起動する。
    pub fn child_process_spawned(self: &Arc<Self>, pid: pid_t) {
        let mut state = self.lock();
        state.generation += 1;
        // 同じ番号の古いプロセスは既に回収済み
        state.forgotten.remove(&pid);
        tracing::trace!(pid, generation = state.generation, "child registered with job store");
        if self.mode != ReapMode::Thread || state.reaper_active {
            return;
        }
        state.reaper_active = true;
        let store = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name("rush-reaper".into())
            .spawn(move || store.reaper_loop());
        if let Err(e) = spawned {
            tracing::error!("failed to start reaper thread: {}", e);
            state.reaper_active = false;
        }
    }

    /// 回収スレッド本体。ロックはブロッキング `waitpid` の間だけ手放す。
    fn reaper_loop(&self) {
        tracing::debug!("reaper thread started");
        let mut state = self.lock();
        loop {
            let seen = state.generation;
            drop(state);
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WUNTRACED) };
            let err = io::Error::last_os_error();
            state = self.lock();

            if pid > 0 {
                if state.forgotten.remove(&pid) {
                    tracing::debug!(pid, "discarded status of a removed job");
                } else {
                    state.statuses.insert(pid, status);
                    self.cond.notify_all();
                }
                continue;
            }
            match err.raw_os_error() {
                Some(libc::EINTR) => {
                    self.cond.notify_all();
                }
                Some(libc::ECHILD) if state.generation != seen => {
                    // 直前に新しい子が起動された。もう一周する。
                }
                Some(libc::ECHILD) => break,
                _ => {
                    tracing::warn!("waitpid failed in reaper: {}", err);
                    if state.generation == seen {
                        break;
                    }
                }
            }
        }
        state.reaper_active = false;
        self.cond.notify_all();
        tracing::debug!("reaper thread exiting");
    }

    /// ジョブリスト中の未完了の段のうち、ステータスが届いているものを 1 つ受け取る。
    ///
    /// リスト順で最初に見つかった pid が選ばれる。見つからなければ `timeout` に従って
    /// 待ち、起きるたびにリストを走査し直す。[`interrupt`](Self::interrupt) されると
    /// 中断要求を消費して `None` を返す。
    pub fn wait_for_job(&self, jobs: &JobList, timeout: WaitTimeout) -> Option<(pid_t, i32)> {
        let deadline = match timeout {
            WaitTimeout::After(d) => Some(Instant::now() + d),
            _ => None,
        };
        let pids = jobs.pending_pids();
        let mut state = self.lock();
        loop {
            if state.interrupted {
                state.interrupted = false;
                tracing::debug!("job wait interrupted");
                return None;
            }
            if self.mode == ReapMode::Signal {
                reap_pids_nonblocking(&pids, &mut state.statuses);
            }
            if let Some(found) = claim_first(&pids, &mut state.statuses) {
                return Some(found);
            }

            let remaining = match (timeout, deadline) {
                (WaitTimeout::Poll, _) => return None,
                (_, Some(deadline)) => match deadline.checked_duration_since(Instant::now()) {
                    Some(d) if !d.is_zero() => Some(d),
                    _ => return None,
                },
                _ => None,
            };

            match self.mode {
                ReapMode::Thread => {
                    // 回収スレッドがいなければ新しいステータスは届かない
                    if !state.reaper_active {
                        return None;
                    }
                    state = match remaining {
                        Some(d) => {
                            self.cond
                                .wait_timeout(state, d)
                                .unwrap_or_else(PoisonError::into_inner)
                                .0
                        }
                        None => self.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
                    };
                }
                ReapMode::Signal => {
                    if pids.is_empty() {
                        return None;
                    }
                    // 短い間隔で待ち、次の周回で pid ごとに回収し直す
                    let step = remaining.map_or(SIGCHLD_POLL, |d| d.min(SIGCHLD_POLL));
                    let seen = sigchld_count();
                    state = self
                        .cond
                        .wait_timeout(state, step)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                    if sigchld_count() != seen {
                        tracing::trace!("SIGCHLD received while waiting");
                    }
                }
            }
        }
    }

    /// 特定 pid のステータスを受け取る。
    pub fn take_status(&self, pid: pid_t) -> Option<i32> {
        self.lock().statuses.remove(&pid)
    }

    /// 届いているステータスをすべて受け取る。
    pub fn take_all(&self) -> Vec<(pid_t, i32)> {
        self.lock().statuses.drain().collect()
    }

    /// 取り外したジョブの pid を手放す。
    ///
    /// 未受領のステータスは捨てる。まだ終了していない段の pid はスレッド方式なら記録しておき、
    /// 後で届いたステータスを捨てる。pid 番号が再利用されても古いステータスは渡らない。
    pub fn forget_job(&self, job: &Job) {
        let mut state = self.lock();
        for p in job.processes.iter().filter(|p| p.pid > 0) {
            if state.statuses.remove(&p.pid).is_some() {
                tracing::debug!(pid = p.pid, "discarded unclaimed status");
            } else if !p.completed && self.mode == ReapMode::Thread {
                state.forgotten.insert(p.pid);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn has_status(&self, pid: pid_t) -> bool {
        self.lock().statuses.contains_key(&pid)
    }

    /// 待機中の呼び出しを中断する。待機者がいなければ次の待機が即座に `None` を返す。
    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.cond.notify_all();
    }

    pub fn is_reaper_active(&self) -> bool {
        self.lock().reaper_active
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    #[cfg(test)]
    fn mark_reaper_active(&self) {
        self.lock().reaper_active = true;
    }
}

/// リスト順で最初にステータスが届いている pid を取り出す。
fn claim_first(pids: &[pid_t], statuses: &mut HashMap<pid_t, i32>) -> Option<(pid_t, i32)> {
    pids.iter()
        .find_map(|pid| statuses.remove(pid).map(|status| (*pid, status)))
}

/// 各 pid に対して `waitpid(WNOHANG | WUNTRACED)` を呼び、結果をマップに入れる。
fn reap_pids_nonblocking(pids: &[pid_t], statuses: &mut HashMap<pid_t, i32>) {
    for &pid in pids {
        if statuses.contains_key(&pid) {
            continue;
        }
        let mut status = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG | libc::WUNTRACED) };
        if ret == pid {
            statuses.insert(pid, status);
        }
    }
}

/// テスト用のプロセス共有ストア。
///
/// スレッド方式の `waitpid(-1)` は他のストアの子も回収してしまうため、
/// 子プロセスを起動するテストはすべてこのストアを使う。
#[cfg(test)]
pub(crate) fn shared_test_store() -> Arc<JobStore> {
    use std::sync::OnceLock;
    static STORE: OnceLock<Arc<JobStore>> = OnceLock::new();
    Arc::clone(STORE.get_or_init(|| Arc::new(JobStore::new(ReapMode::Thread))))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::job_id::JobIdAllocator;

    #[test]
    fn poll_does_not_block_for_running_job() {
        let store = shared_test_store();
        let ids = Arc::new(JobIdAllocator::new());
        let pid = spawn_sh("sleep 5");
        let mut jobs = JobList::new();
        jobs.add(job_for(&ids, &[pid]));

        let start = Instant::now();
        assert_eq!(store.wait_for_job(&jobs, WaitTimeout::Poll), None);
        assert!(start.elapsed() < Duration::from_secs(1));

        unsafe { libc::kill(pid, libc::SIGKILL) };
        let (got, status) = store.wait_for_job(&jobs, WaitTimeout::Forever).unwrap();
        assert_eq!(got, pid);
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGKILL);
    }

    #[test]
    fn exit_status_is_claimed_exactly_once() {
        let store = shared_test_store();
        let ids = Arc::new(JobIdAllocator::new());
        let pid = spawn_sh("exit 7");
        let mut jobs = JobList::new();
        jobs.add(job_for(&ids, &[pid]));

        let (got, status) = store
            .wait_for_job(&jobs, WaitTimeout::After(Duration::from_secs(10)))
            .unwrap();
        assert_eq!(got, pid);
        assert_eq!(libc::WEXITSTATUS(status), 7);
        assert_eq!(store.take_status(pid), None);
    }

    #[test]
    fn first_pid_in_list_order_wins() {
        let store = shared_test_store();
        let ids = Arc::new(JobIdAllocator::new());
        let a = spawn_sh("exit 1");
        let b = spawn_sh("exit 2");
        let mut jobs = JobList::new();
        jobs.add(job_for(&ids, &[b]));
        jobs.add(job_for(&ids, &[a]));

        // 両方が回収されるまで待ってから受け取る
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let st = store.lock();
            if st.statuses.contains_key(&a) && st.statuses.contains_key(&b) {
                break;
            }
            drop(st);
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(store.wait_for_job(&jobs, WaitTimeout::Poll).map(|r| r.0), Some(a));
        assert_eq!(store.wait_for_job(&jobs, WaitTimeout::Poll).map(|r| r.0), Some(b));
    }

    #[test]
    fn timed_wait_expires() {
        let store = JobStore::new(ReapMode::Thread);
        store.mark_reaper_active();
        let jobs = JobList::new();
        let start = Instant::now();
        assert_eq!(
            store.wait_for_job(&jobs, WaitTimeout::After(Duration::from_millis(30))),
            None
        );
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn interrupt_wakes_indefinite_wait() {
        let store = Arc::new(JobStore::new(ReapMode::Thread));
        store.mark_reaper_active();
        let waker = Arc::clone(&store);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            waker.interrupt();
        });
        let jobs = JobList::new();
        assert_eq!(store.wait_for_job(&jobs, WaitTimeout::Forever), None);
        handle.join().unwrap();
        // 中断要求は消費済み
        assert!(!store.lock().interrupted);
    }

    #[test]
    fn wait_without_reaper_returns_immediately() {
        let store = JobStore::new(ReapMode::Thread);
        let jobs = JobList::new();
        assert_eq!(store.wait_for_job(&jobs, WaitTimeout::Forever), None);
    }

    #[test]
    fn signal_mode_poll_without_children() {
        let store = JobStore::new(ReapMode::Signal);
        let jobs = JobList::new();
        assert_eq!(store.wait_for_job(&jobs, WaitTimeout::Forever), None);
        assert!(!store.is_reaper_active());
    }
}
