//! プロセス全体で共有する状態。
//!
//! ジョブストア、ジョブ ID アロケータ、設定、キャンセル要求をまとめ、
//! 起動時に一度だけ作って [`Parser`](crate::parser::Parser) へ共有参照で渡す。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::config::ShellConfig;
use crate::job_id::JobIdAllocator;
use crate::reaper::JobStore;

#[derive(Debug)]
pub struct ShellContext {
    pub config: ShellConfig,
    pub job_store: Arc<JobStore>,
    pub job_ids: Arc<JobIdAllocator>,
    main_thread: ThreadId,
    cancellation_requested: AtomicBool,
}

impl ShellContext {
    /// 呼び出したスレッドをメインスレッドとして記録する。
    pub fn new(config: ShellConfig) -> Arc<Self> {
        let store = Arc::new(JobStore::new(config.reap_mode));
        Self::with_store(config, store)
    }

    /// 既存のジョブストアを使う。
    pub fn with_store(config: ShellConfig, job_store: Arc<JobStore>) -> Arc<Self> {
        Arc::new(ShellContext {
            config,
            job_store,
            job_ids: Arc::new(JobIdAllocator::new()),
            main_thread: thread::current().id(),
            cancellation_requested: AtomicBool::new(false),
        })
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    pub fn is_interactive_session(&self) -> bool {
        self.config.interactive_session
    }

    pub fn cancellation_requested(&self) -> bool {
        self.cancellation_requested.load(Ordering::Acquire)
    }

    /// キャンセル要求を立てる。メインスレッドからのみ。
    pub(crate) fn request_cancellation(&self) {
        debug_assert!(self.is_main_thread(), "cancellation requested off the main thread");
        self.cancellation_requested.store(true, Ordering::Release);
    }

    pub(crate) fn clear_cancellation(&self) {
        self.cancellation_requested.store(false, Ordering::Release);
    }
}
