//! エクスポート配列キャッシュ。
//!
//! 子プロセスに渡す `KEY=VALUE` 配列を遅延的に作り直す。エクスポート状態に関わる変更は
//! dirty フラグを立てるだけで、配列が要求されたときに dirty なら再構築する。
//! フラグはアトミックで、env ロックを持ったままでも立てられる。

use std::collections::BTreeMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::env::{is_colon_delimited, EnvStack, ARRAY_SEP, ENV_NULL, GLOBAL};

#[derive(Debug)]
pub(crate) struct ExportCache {
    dirty: AtomicBool,
    array: Mutex<Arc<Vec<CString>>>,
    rebuilds: AtomicUsize,
}

impl ExportCache {
    pub(crate) fn new() -> Self {
        ExportCache {
            dirty: AtomicBool::new(true),
            array: Mutex::new(Arc::new(Vec::new())),
            rebuilds: AtomicUsize::new(0),
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// `KEY=VALUE` 形式に整形する。`:` 区切り変数は配列区切りを `:` に戻す。
fn format_entry(key: &str, val: &str) -> Option<CString> {
    let val = if is_colon_delimited(key) {
        val.replace(ARRAY_SEP, ":")
    } else {
        val.to_string()
    };
    match CString::new(format!("{}={}", key, val)) {
        Ok(c) => Some(c),
        Err(_) => {
            tracing::warn!(key, "exported variable contains NUL, skipped");
            None
        }
    }
}

impl EnvStack {
    /// 必要ならエクスポート配列を作り直す。
    ///
    /// `force_barrier` ならまずユニバーサル変数の同期バリアを走らせる（1 コマンドに 1 回）。
    /// 再構築は top からグローバルへ参照と同じ順にたどり、最も内側の値を採用する。
    /// ユニバーサル変数は既にある名前を上書きしない。
    pub fn update_export_array_if_necessary(&self, force_barrier: bool) {
        if force_barrier {
            let changes = self.shared.universal.barrier_once();
            self.apply_universal_changes(changes);
        }
        let cache = &self.shared.export;
        // 走査前に下ろす。再構築中の mark_dirty は次回に持ち越される
        if !cache.dirty.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut vals: BTreeMap<String, String> = BTreeMap::new();
        {
            let arena = self.arena();
            let mut cursor = Some(self.top);
            while let Some(id) = cursor {
                for (key, entry) in &arena.node(id).vars {
                    if entry.exported && entry.val != ENV_NULL {
                        vals.entry(key.clone()).or_insert_with(|| entry.val.clone());
                    }
                }
                cursor = if id == GLOBAL { None } else { arena.next_scope(id) };
            }
        }

        let store = self.shared.universal.store();
        for key in store.get_names(true, false) {
            if let Some(val) = store.get(&key) {
                if val != ENV_NULL {
                    vals.entry(key).or_insert(val);
                }
            }
        }

        let array: Vec<CString> = vals
            .iter()
            .filter_map(|(k, v)| format_entry(k, v))
            .collect();
        tracing::debug!(count = array.len(), "export array rebuilt");
        *cache.array.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(array);
        cache.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// 最後に構築したエクスポート配列。
    pub fn export_array(&self) -> Arc<Vec<CString>> {
        Arc::clone(&self.shared.export.array.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// 必要なら作り直してから配列を返す。
    pub fn exported_environment(&self) -> Arc<Vec<CString>> {
        self.update_export_array_if_necessary(true);
        self.export_array()
    }

    /// これまでの再構築回数。
    pub fn export_rebuilds(&self) -> usize {
        self.shared.export.rebuilds.load(Ordering::Relaxed)
    }
}
