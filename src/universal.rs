//! ユニバーサル変数ブリッジ。
//!
//! ユニバーサル変数はシェルインスタンス間で共有される変数で、実体は外部ストアにある。
//! ここではストアとの契約（[`UniversalStore`]）と同期バリア（[`UniversalBridge`]）を定義する。
//! 変数スタックはストアの中身に直接触れず、書き込みスルーとバリア経由でのみ扱う。
//!
//! [`MemoryUniversalStore`] は共有テーブルをメモリ上に持つ実装で、
//! [`connect`](MemoryUniversalStore::connect) で「別のシェル」を模した接続を作れる。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

/// 同期で届いた変更の種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Set,
    Erase,
}

impl ChangeKind {
    /// イベント引数として使う名前。
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Set => "SET",
            ChangeKind::Erase => "ERASE",
        }
    }
}

/// バリアで受け取った 1 件の変更。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniversalChange {
    pub kind: ChangeKind,
    pub key: String,
    pub value: Option<String>,
}

/// ユニバーサル変数ストアの契約。
///
/// `set` / `remove` はローカルの保留変更として記録され、`sync` で共有側へ押し出される。
/// `sync` は押し出した変更と他インスタンスから取り込んだ変更を `changes` に追記し、
/// どちらかがあれば `true` を返す。
pub trait UniversalStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn get_export(&self, key: &str) -> bool;
    fn set(&self, key: &str, value: &str, exported: bool);
    fn remove(&self, key: &str) -> bool;
    fn get_names(&self, want_exported: bool, want_unexported: bool) -> Vec<String>;
    fn sync(&self, changes: &mut Vec<UniversalChange>) -> bool;
}

// ── メモリ上のストア ──

#[derive(Debug, Clone, PartialEq, Eq)]
struct UniversalVar {
    value: String,
    exported: bool,
}

/// 共有テーブル。変更はログとして残し、各接続は読み終えた位置を覚える。
#[derive(Debug, Default)]
struct SharedTable {
    next_origin: u64,
    vars: BTreeMap<String, UniversalVar>,
    log: Vec<(u64, UniversalChange)>,
}

#[derive(Debug, Default)]
struct LocalView {
    vars: BTreeMap<String, UniversalVar>,
    pending: Vec<(UniversalChange, bool)>,
    seen: usize,
}

/// メモリ上の共有テーブルに対する 1 接続。
#[derive(Debug)]
pub struct MemoryUniversalStore {
    origin: u64,
    shared: Arc<Mutex<SharedTable>>,
    local: Mutex<LocalView>,
}

impl Default for MemoryUniversalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUniversalStore {
    pub fn new() -> Self {
        let table = SharedTable { next_origin: 1, ..SharedTable::default() };
        MemoryUniversalStore {
            origin: 0,
            shared: Arc::new(Mutex::new(table)),
            local: Mutex::new(LocalView::default()),
        }
    }

    /// 同じ共有テーブルに対する新しい接続を作る。
    /// 既存の内容は最初の `sync` まで見えない。
    pub fn connect(&self) -> Self {
        let shared = Arc::clone(&self.shared);
        let origin = {
            let mut table = shared.lock().unwrap_or_else(PoisonError::into_inner);
            table.next_origin += 1;
            table.next_origin - 1
        };
        MemoryUniversalStore {
            origin,
            shared,
            local: Mutex::new(LocalView::default()),
        }
    }

    fn local(&self) -> std::sync::MutexGuard<'_, LocalView> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UniversalStore for MemoryUniversalStore {
    fn get(&self, key: &str) -> Option<String> {
        self.local().vars.get(key).map(|v| v.value.clone())
    }

    fn get_export(&self, key: &str) -> bool {
        self.local().vars.get(key).is_some_and(|v| v.exported)
    }

    fn set(&self, key: &str, value: &str, exported: bool) {
        let mut local = self.local();
        local.vars.insert(
            key.to_string(),
            UniversalVar { value: value.to_string(), exported },
        );
        let change = UniversalChange {
            kind: ChangeKind::Set,
            key: key.to_string(),
            value: Some(value.to_string()),
        };
        local.pending.push((change, exported));
    }

    fn remove(&self, key: &str) -> bool {
        let mut local = self.local();
        if local.vars.remove(key).is_none() {
            return false;
        }
        let change = UniversalChange { kind: ChangeKind::Erase, key: key.to_string(), value: None };
        local.pending.push((change, false));
        true
    }

    fn get_names(&self, want_exported: bool, want_unexported: bool) -> Vec<String> {
        self.local()
            .vars
            .iter()
            .filter(|(_, v)| if v.exported { want_exported } else { want_unexported })
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn sync(&self, changes: &mut Vec<UniversalChange>) -> bool {
        let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let mut local = self.local();

        // 他の接続の変更を取り込む
        let mut pulled = false;
        let start = local.seen;
        for (origin, change) in &shared.log[start..] {
            if *origin == self.origin {
                continue;
            }
            match change.kind {
                ChangeKind::Set => {
                    let exported = shared.vars.get(&change.key).is_some_and(|v| v.exported);
                    let value = change.value.clone().unwrap_or_default();
                    local.vars.insert(change.key.clone(), UniversalVar { value, exported });
                }
                ChangeKind::Erase => {
                    local.vars.remove(&change.key);
                }
            }
            changes.push(change.clone());
            pulled = true;
        }

        // 自分の保留変更を押し出す
        let pending = std::mem::take(&mut local.pending);
        let mut pushed = false;
        for (change, exported) in pending {
            match change.kind {
                ChangeKind::Set => {
                    let value = change.value.clone().unwrap_or_default();
                    shared.vars.insert(change.key.clone(), UniversalVar { value, exported });
                }
                ChangeKind::Erase => {
                    shared.vars.remove(&change.key);
                }
            }
            changes.push(change.clone());
            shared.log.push((self.origin, change));
            pushed = true;
        }
        local.seen = shared.log.len();
        pulled || pushed
    }
}

// ── 同期バリア ──

/// ストアと同期バリアのまとめ役。
///
/// バリアはブロッキング I/O を伴うためメインスレッドからしか走らせない。
/// 変数参照からのバリアは 1 コマンドにつき 1 回に抑える（`had_barrier`）。
pub struct UniversalBridge {
    store: Arc<dyn UniversalStore>,
    main_thread: ThreadId,
    had_barrier: AtomicBool,
}

impl std::fmt::Debug for UniversalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniversalBridge")
            .field("main_thread", &self.main_thread)
            .field("had_barrier", &self.had_barrier.load(Ordering::Relaxed))
            .finish()
    }
}

impl UniversalBridge {
    /// 呼び出したスレッドをメインスレッドとして記録する。
    pub fn new(store: Arc<dyn UniversalStore>) -> Self {
        UniversalBridge {
            store,
            main_thread: thread::current().id(),
            had_barrier: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &dyn UniversalStore {
        self.store.as_ref()
    }

    pub fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// 同期バリアを実行し、取り込んだ変更を返す。メインスレッド以外では何もしない。
    pub fn barrier(&self) -> Vec<UniversalChange> {
        if !self.is_main_thread() {
            tracing::trace!("universal barrier skipped off the main thread");
            return Vec::new();
        }
        let mut changes = Vec::new();
        if self.store.sync(&mut changes) {
            tracing::debug!(count = changes.len(), "universal variables changed remotely");
        }
        changes
    }

    /// このコマンド中でまだバリアを実行していなければ実行する。
    pub fn barrier_once(&self) -> Vec<UniversalChange> {
        if !self.is_main_thread() || self.had_barrier.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }
        self.barrier()
    }

    /// 新しいコマンドの開始。次の参照で再びバリアが走る。
    pub fn begin_command(&self) {
        self.had_barrier.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_changes_reach_other_connection_after_sync() {
        let a = MemoryUniversalStore::new();
        let b = a.connect();
        a.set("fish_greeting", "hi", false);
        assert_eq!(b.get("fish_greeting"), None);

        // a の同期は自分の変更を押し出して報告する
        let mut pushed = Vec::new();
        assert!(a.sync(&mut pushed));
        assert_eq!(pushed.len(), 1);
        assert!(!a.sync(&mut Vec::new()));

        let mut pulled = Vec::new();
        assert!(b.sync(&mut pulled));
        assert_eq!(b.get("fish_greeting").as_deref(), Some("hi"));
        assert_eq!(
            pulled,
            vec![UniversalChange {
                kind: ChangeKind::Set,
                key: "fish_greeting".into(),
                value: Some("hi".into())
            }]
        );
    }

    #[test]
    fn erase_propagates() {
        let a = MemoryUniversalStore::new();
        let b = a.connect();
        a.set("EDITOR", "vi", true);
        a.sync(&mut Vec::new());
        b.sync(&mut Vec::new());
        assert!(b.get_export("EDITOR"));

        assert!(b.remove("EDITOR"));
        assert!(!b.remove("EDITOR"));
        b.sync(&mut Vec::new());
        let mut changes = Vec::new();
        a.sync(&mut changes);
        assert_eq!(a.get("EDITOR"), None);
        assert_eq!(changes[0].kind, ChangeKind::Erase);
    }

    #[test]
    fn names_respect_export_filter() {
        let store = MemoryUniversalStore::new();
        store.set("A", "1", true);
        store.set("B", "2", false);
        assert_eq!(store.get_names(true, false), vec!["A"]);
        assert_eq!(store.get_names(false, true), vec!["B"]);
        assert_eq!(store.get_names(true, true).len(), 2);
    }

    #[test]
    fn barrier_once_runs_once_per_command() {
        let store = Arc::new(MemoryUniversalStore::new());
        let other = store.connect();
        let bridge = UniversalBridge::new(store.clone());

        other.set("X", "1", false);
        other.sync(&mut Vec::new());
        assert_eq!(bridge.barrier_once().len(), 1);

        other.set("X", "2", false);
        other.sync(&mut Vec::new());
        // 同じコマンド中は再実行しない
        assert!(bridge.barrier_once().is_empty());
        bridge.begin_command();
        assert_eq!(bridge.barrier_once().len(), 1);
        assert_eq!(store.get("X").as_deref(), Some("2"));
    }

    #[test]
    fn other_threads_are_not_main() {
        let store = Arc::new(MemoryUniversalStore::new());
        let bridge = Arc::new(UniversalBridge::new(store));
        let b = Arc::clone(&bridge);
        let ran = std::thread::spawn(move || b.is_main_thread()).join().unwrap();
        assert!(!ran);
    }
}
