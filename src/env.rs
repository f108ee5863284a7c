//! スコープ付き変数スタック。
//!
//! 変数はスコープフレーム（ノード）の連なりに置かれる。最下層のグローバルノードは決して
//! pop されない。関数呼び出しで積まれるノードは「新スコープ境界」で、ローカル参照は
//! 境界に達するとグローバルノードへ直接ジャンプする（呼び出し元のローカルは見えない）。
//!
//! ノードはアリーナに置き、親は添字で指す。子スタック（[`EnvStack::child`]）は親の
//! 現在の top を起点かつ境界として共有するため、ノードは参照カウントで寿命を管理する。
//! アリーナ全体を 1 つのミューテックス（env ロック）で守る。
//!
//! 変更系の操作は、ロックを解放してからイベント発火と変数ごとの反応処理を行う。

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::EnvError;
use crate::event::{Event, EventSink, NullSink};
use crate::export::ExportCache;
use crate::universal::{MemoryUniversalStore, UniversalBridge, UniversalChange, UniversalStore};

/// 「値なし」（要素 0 の配列）を表す内部値。
pub const ENV_NULL: &str = "\x1d";

/// 配列要素の区切り。
pub const ARRAY_SEP: char = '\x1e';

/// ユーザが変更できない変数。`SHLVL` は初期化後に加わる。
const READ_ONLY: &[&str] = &[
    "status",
    "history",
    "version",
    "_",
    "LINES",
    "COLUMNS",
    "PWD",
    "RUSH_VERSION",
];

/// 値を保持せず、参照時に計算する変数。
const ELECTRIC: &[&str] = &["history", "status", "umask", "COLUMNS", "LINES"];

const LOCALE_VARS: &[&str] = &[
    "LANG",
    "LC_ALL",
    "LC_COLLATE",
    "LC_CTYPE",
    "LC_MESSAGES",
    "LC_MONETARY",
    "LC_NUMERIC",
    "LC_TIME",
];

/// 個別カテゴリの変数と `setlocale` カテゴリの対応。
const LOCALE_CATEGORIES: &[(&str, libc::c_int)] = &[
    ("LC_COLLATE", libc::LC_COLLATE),
    ("LC_CTYPE", libc::LC_CTYPE),
    ("LC_MESSAGES", libc::LC_MESSAGES),
    ("LC_MONETARY", libc::LC_MONETARY),
    ("LC_NUMERIC", libc::LC_NUMERIC),
    ("LC_TIME", libc::LC_TIME),
];

/// 環境変数として `:` 区切りで受け渡す配列変数。
const COLON_DELIMITED: &[&str] = &["PATH", "MANPATH", "CDPATH"];

/// 色設定変数の接頭辞。
const COLOR_PREFIX: &str = "rush_color_";

pub fn is_electric(key: &str) -> bool {
    ELECTRIC.contains(&key)
}

pub fn is_locale_var(key: &str) -> bool {
    LOCALE_VARS.contains(&key)
}

pub fn is_colon_delimited(key: &str) -> bool {
    COLON_DELIMITED.contains(&key)
}

// ── モード ───────────────────────────────────────────────────────────

/// 変数操作のスコープ・エクスポート指定。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvMode(u8);

impl EnvMode {
    pub const DEFAULT: EnvMode = EnvMode(0);
    pub const LOCAL: EnvMode = EnvMode(1);
    pub const EXPORT: EnvMode = EnvMode(2);
    pub const GLOBAL: EnvMode = EnvMode(4);
    /// ユーザ操作（`set` コマンド）による要求。読み取り専用変数を拒否する。
    pub const USER: EnvMode = EnvMode(8);
    pub const UNEXPORT: EnvMode = EnvMode(16);
    pub const UNIVERSAL: EnvMode = EnvMode(32);

    pub fn contains(self, other: EnvMode) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EnvMode) -> bool {
        self.0 & other.0 != 0
    }

    fn has_scope(self) -> bool {
        self.intersects(EnvMode::LOCAL | EnvMode::GLOBAL | EnvMode::UNIVERSAL)
    }

    /// `(exported を対象にするか, unexported を対象にするか)`。
    fn export_filter(self) -> (bool, bool) {
        let exported = self.contains(EnvMode::EXPORT) || !self.contains(EnvMode::UNEXPORT);
        let unexported = self.contains(EnvMode::UNEXPORT) || !self.contains(EnvMode::EXPORT);
        (exported, unexported)
    }
}

impl std::ops::BitOr for EnvMode {
    type Output = EnvMode;

    fn bitor(self, rhs: EnvMode) -> EnvMode {
        EnvMode(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EnvMode {
    fn bitor_assign(&mut self, rhs: EnvMode) {
        self.0 |= rhs.0;
    }
}

// ── ノードとアリーナ ─────────────────────────────────────────────────

/// 1 変数。`val` は [`ENV_NULL`] のこともある。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarEntry {
    pub val: String,
    pub exported: bool,
}

pub(crate) type NodeId = usize;

/// グローバルノードは常に添字 0。
pub(crate) const GLOBAL: NodeId = 0;

#[derive(Debug, Default)]
pub(crate) struct EnvNode {
    pub(crate) vars: BTreeMap<String, VarEntry>,
    pub(crate) parent: Option<NodeId>,
    /// 関数呼び出しなどの新スコープ境界か。
    pub(crate) new_scope: bool,
    /// エクスポート変数を含むかもしれない（偽なら確実に含まない）。
    exportv: bool,
    /// 0 なら解放済み。
    refs: usize,
}

impl EnvNode {
    fn find_entry(&self, key: &str) -> Option<&VarEntry> {
        self.vars.get(key)
    }

    fn find_or_create_entry(&mut self, key: &str) -> &mut VarEntry {
        self.vars.entry(key.to_string()).or_insert_with(|| VarEntry {
            val: ENV_NULL.to_string(),
            exported: false,
        })
    }

    fn remove_entry(&mut self, key: &str) -> Option<VarEntry> {
        self.vars.remove(key)
    }
}

#[derive(Debug)]
pub(crate) struct Arena {
    nodes: Vec<EnvNode>,
    free: Vec<NodeId>,
}

impl Arena {
    fn new() -> Self {
        let global = EnvNode { refs: 1, ..EnvNode::default() };
        Arena { nodes: vec![global], free: Vec::new() }
    }

    pub(crate) fn node(&self, id: NodeId) -> &EnvNode {
        &self.nodes[id]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut EnvNode {
        &mut self.nodes[id]
    }

    /// 参照カウント 1（作成したスタックの top 参照）のノードを作る。
    fn alloc(&mut self, parent: NodeId, new_scope: bool) -> NodeId {
        let node = EnvNode {
            parent: Some(parent),
            new_scope,
            refs: 1,
            ..EnvNode::default()
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn retain(&mut self, id: NodeId) {
        if id != GLOBAL {
            self.nodes[id].refs += 1;
        }
    }

    /// 参照を 1 つ手放す。0 になったノードは解放し、親への参照も手放す。
    fn release(&mut self, mut id: NodeId) {
        while id != GLOBAL {
            let node = &mut self.nodes[id];
            node.refs -= 1;
            if node.refs > 0 {
                return;
            }
            let parent = node.parent;
            *node = EnvNode::default();
            self.free.push(id);
            match parent {
                Some(p) => id = p,
                None => return,
            }
        }
    }

    /// 参照で次に調べるノード。境界ではグローバルへ飛ぶ。
    pub(crate) fn next_scope(&self, id: NodeId) -> Option<NodeId> {
        if id == GLOBAL {
            return None;
        }
        let node = self.node(id);
        if node.new_scope {
            Some(GLOBAL)
        } else {
            node.parent
        }
    }

    /// `id` 自身か、境界までの透過的な祖先がエクスポート変数を持つかもしれないか。
    fn local_scope_exports(&self, mut id: NodeId) -> bool {
        loop {
            if id == GLOBAL {
                return false;
            }
            let node = self.node(id);
            if node.exportv {
                return true;
            }
            if node.new_scope {
                return false;
            }
            match node.parent {
                Some(p) => id = p,
                None => return false,
            }
        }
    }

    #[cfg(test)]
    fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.refs > 0).count()
    }
}

// ── 共有状態 ─────────────────────────────────────────────────────────

/// 端末表示層への通知。ロケール・色の変更はイベントではなく直接呼び出しで伝える。
pub trait DisplayHooks: Send + Sync {
    fn locale_changed(&self, _locale: &str) {}
    fn color_support_changed(&self, _term256: bool, _term24bit: bool) {}
    fn colors_changed(&self) {}
}

#[derive(Debug, Default)]
pub struct NoDisplay;

impl DisplayHooks for NoDisplay {}

/// スタックの外側の協調相手。
pub struct EnvCollaborators {
    pub universal: Arc<dyn UniversalStore>,
    pub events: Arc<dyn EventSink>,
    pub display: Arc<dyn DisplayHooks>,
}

impl Default for EnvCollaborators {
    fn default() -> Self {
        EnvCollaborators {
            universal: Arc::new(MemoryUniversalStore::new()),
            events: Arc::new(NullSink),
            display: Arc::new(NoDisplay),
        }
    }
}

/// 親スタックと子スタックが共有する状態。
pub(crate) struct EnvShared {
    arena: Mutex<Arena>,
    pub(crate) export: ExportCache,
    pub(crate) universal: UniversalBridge,
    events: Arc<dyn EventSink>,
    display: Arc<dyn DisplayHooks>,
    last_status: AtomicI32,
    history: Mutex<Vec<String>>,
    shlvl_read_only: AtomicBool,
}

// ── 読み取りインターフェース ─────────────────────────────────────────

/// 変数の読み取り口。スタックとスナップショットが実装する。
pub trait Environment {
    fn get(&self, key: &str, mode: EnvMode) -> Option<String>;
    fn get_names(&self, mode: EnvMode) -> Vec<String>;
}

/// 選ばれた変数だけを写し取った不変のスナップショット。別スレッドへ渡せる。
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    /// 構文ハイライトが参照する変数。
    pub const HIGHLIGHTING_KEYS: &'static [&'static str] =
        &["PATH", "CDPATH", "rush_function_path", "PWD"];

    pub fn new(env: &dyn Environment, keys: &[&str]) -> Self {
        let vars = keys
            .iter()
            .filter_map(|k| env.get(k, EnvMode::DEFAULT).map(|v| (k.to_string(), v)))
            .collect();
        EnvSnapshot { vars }
    }
}

impl Environment for EnvSnapshot {
    fn get(&self, key: &str, _mode: EnvMode) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn get_names(&self, _mode: EnvMode) -> Vec<String> {
        self.vars.keys().cloned().collect()
    }
}

/// `PWD` の値を末尾 `/` 付きで返す。未設定なら空文字列。
pub fn pwd_slash(env: &dyn Environment) -> String {
    match env.get("PWD", EnvMode::DEFAULT) {
        Some(mut pwd) if !pwd.is_empty() => {
            if !pwd.ends_with('/') {
                pwd.push('/');
            }
            pwd
        }
        _ => String::new(),
    }
}

// ── スタック ─────────────────────────────────────────────────────────

/// 変更の行き先。
enum Target {
    Node(NodeId),
    Universal { exported: bool },
}

/// 変数スタック。
pub struct EnvStack {
    pub(crate) shared: Arc<EnvShared>,
    pub(crate) top: NodeId,
    /// 子スタックの場合、これより下へは pop できない。
    boundary: Option<NodeId>,
}

impl EnvStack {
    /// グローバルノードだけのスタックを作る。呼び出したスレッドをメインスレッドとする。
    pub fn new(collab: EnvCollaborators) -> Self {
        let shared = EnvShared {
            arena: Mutex::new(Arena::new()),
            export: ExportCache::new(),
            universal: UniversalBridge::new(collab.universal),
            events: collab.events,
            display: collab.display,
            last_status: AtomicI32::new(0),
            history: Mutex::new(Vec::new()),
            shlvl_read_only: AtomicBool::new(false),
        };
        EnvStack { shared: Arc::new(shared), top: GLOBAL, boundary: None }
    }

    /// 同じグローバルノードを共有し、現在の top から始まる子スタックを作る。
    /// 子スタックは起点より下へ pop できない。
    pub fn child(&self) -> EnvStack {
        let mut arena = self.arena();
        arena.retain(self.top);
        arena.retain(self.top);
        EnvStack {
            shared: Arc::clone(&self.shared),
            top: self.top,
            boundary: Some(self.top),
        }
    }

    pub(crate) fn arena(&self) -> MutexGuard<'_, Arena> {
        self.shared.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn universal(&self) -> &UniversalBridge {
        &self.shared.universal
    }

    /// イベントを発火する。env ロックを持ったまま呼んではならない。
    pub fn fire_event(&self, event: &Event) {
        self.shared.events.fire(event);
    }

    pub fn is_read_only(&self, key: &str) -> bool {
        READ_ONLY.contains(&key)
            || (key == "SHLVL" && self.shared.shlvl_read_only.load(Ordering::Acquire))
    }

    // ── electric 変数の実体 ──

    pub fn last_status(&self) -> i32 {
        self.shared.last_status.load(Ordering::Acquire)
    }

    pub fn set_last_status(&self, status: i32) {
        self.shared.last_status.store(status, Ordering::Release);
    }

    /// 履歴に 1 件追加する（`history` 変数は新しい順）。
    pub fn add_history(&self, line: &str) {
        self.shared
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }

    fn electric_value(&self, key: &str) -> Option<String> {
        match key {
            "history" => {
                // 履歴はメインスレッドからしか読まない
                if !self.shared.universal.is_main_thread() {
                    return None;
                }
                let history = self.shared.history.lock().unwrap_or_else(PoisonError::into_inner);
                let items: Vec<&str> = history.iter().rev().map(String::as_str).collect();
                Some(items.join(&ARRAY_SEP.to_string()))
            }
            "COLUMNS" => Some(terminal_size().0.to_string()),
            "LINES" => Some(terminal_size().1.to_string()),
            "status" => Some(self.last_status().to_string()),
            "umask" => Some(format!("0{:03o}", current_umask())),
            _ => None,
        }
    }

    // ── 参照 ──

    /// 変数の値を返す。見つからない、または値なし（[`ENV_NULL`]）なら `None`。
    pub fn get(&self, key: &str, mode: EnvMode) -> Option<String> {
        let has_scope = mode.has_scope();
        let search_local = !has_scope || mode.contains(EnvMode::LOCAL);
        let search_global = !has_scope || mode.contains(EnvMode::GLOBAL);
        let search_universal = !has_scope || mode.contains(EnvMode::UNIVERSAL);
        let (want_exported, want_unexported) = mode.export_filter();

        // electric 変数は他のスコープに置けないので、ここで確定する
        if is_electric(key) {
            if !search_global {
                return None;
            }
            return self.electric_value(key);
        }

        if search_local || search_global {
            let arena = self.arena();
            let mut cursor = Some(if search_local { self.top } else { GLOBAL });
            while let Some(id) = cursor {
                if let Some(entry) = arena.node(id).find_entry(key) {
                    let wanted = if entry.exported { want_exported } else { want_unexported };
                    if wanted {
                        if entry.val == ENV_NULL {
                            return None;
                        }
                        return Some(entry.val.clone());
                    }
                }
                cursor = if has_scope {
                    if !search_global || id == GLOBAL {
                        None
                    } else {
                        Some(GLOBAL)
                    }
                } else {
                    arena.next_scope(id)
                };
            }
        }

        if !search_universal {
            return None;
        }

        // バリアはロックの外で、1 コマンドにつき 1 回だけ
        let changes = self.shared.universal.barrier_once();
        self.apply_universal_changes(changes);

        let store = self.shared.universal.store();
        let val = store.get(key)?;
        let wanted = if store.get_export(key) { want_exported } else { want_unexported };
        if val == ENV_NULL || !wanted {
            return None;
        }
        Some(val)
    }

    /// 変数が存在するか。値なし（空配列）の変数も存在する扱い。
    pub fn exist(&self, key: &str, mode: EnvMode) -> bool {
        let has_scope = mode.has_scope();
        let test_local = !has_scope || mode.contains(EnvMode::LOCAL);
        let test_global = !has_scope || mode.contains(EnvMode::GLOBAL);
        let test_universal = !has_scope || mode.contains(EnvMode::UNIVERSAL);
        let (test_exported, test_unexported) = mode.export_filter();

        // electric 変数はすべてグローバルかつ非エクスポート
        if is_electric(key) {
            return test_global && test_unexported;
        }

        if test_local || test_global {
            let arena = self.arena();
            let mut cursor = Some(if test_local { self.top } else { GLOBAL });
            while let Some(id) = cursor {
                if let Some(entry) = arena.node(id).find_entry(key) {
                    return if entry.exported { test_exported } else { test_unexported };
                }
                cursor = if has_scope {
                    if !test_global || id == GLOBAL {
                        None
                    } else {
                        Some(GLOBAL)
                    }
                } else {
                    arena.next_scope(id)
                };
            }
        }

        if test_universal {
            let changes = self.shared.universal.barrier_once();
            self.apply_universal_changes(changes);
            let store = self.shared.universal.store();
            if store.get(key).is_some() {
                return if store.get_export(key) { test_exported } else { test_unexported };
            }
        }
        false
    }

    /// 見える範囲で `key` を持つ最も内側のノード。
    fn find_node(&self, arena: &Arena, key: &str) -> Option<NodeId> {
        let mut cursor = Some(self.top);
        while let Some(id) = cursor {
            if arena.node(id).find_entry(key).is_some() {
                return Some(id);
            }
            cursor = arena.next_scope(id);
        }
        None
    }

    /// top から最も近い新スコープ境界（なければグローバル）。
    fn innermost_scope(&self, arena: &Arena) -> NodeId {
        let mut id = self.top;
        loop {
            let node = arena.node(id);
            match node.parent {
                Some(parent) if !node.new_scope => id = parent,
                _ => return id,
            }
        }
    }

    // ── 変更 ──

    /// 変数を設定する。`val` が `None` なら要素 0 の配列。
    pub fn set(&self, key: &str, val: Option<&str>, mode: EnvMode) -> Result<(), EnvError> {
        if let Some(v) = val {
            if key == "PWD" || key == "HOME" {
                let canonical = canonical_path(v);
                if canonical != v {
                    return self.set(key, Some(&canonical), mode);
                }
            }
        }

        let read_only = self.is_read_only(key);
        if mode.intersects(EnvMode::LOCAL | EnvMode::UNIVERSAL) && (read_only || is_electric(key)) {
            return Err(EnvError::Scope(key.to_string()));
        }
        if mode.contains(EnvMode::EXPORT) && is_electric(key) {
            return Err(EnvError::Scope(key.to_string()));
        }
        if mode.contains(EnvMode::USER) && read_only {
            return Err(EnvError::Permission(key.to_string()));
        }

        if key == "umask" {
            // 変数としては保存しない。参照時に umask(2) から計算する。
            let mask = val.and_then(parse_umask).ok_or_else(|| EnvError::Invalid(key.to_string()))?;
            unsafe { libc::umask(mask as libc::mode_t) };
            return Ok(());
        }

        let val = val.unwrap_or(ENV_NULL);
        let explicit_export = if mode.contains(EnvMode::EXPORT) {
            Some(true)
        } else if mode.contains(EnvMode::UNEXPORT) {
            Some(false)
        } else {
            None
        };

        let target = if mode.contains(EnvMode::UNIVERSAL) {
            let old = self.shared.universal.store().get_export(key);
            Target::Universal { exported: explicit_export.unwrap_or(old) }
        } else {
            self.choose_target(key, mode, explicit_export)
        };

        match target {
            Target::Universal { exported } => {
                let store = self.shared.universal.store();
                let old_export = store.get_export(key);
                store.set(key, val, exported);
                let changes = self.shared.universal.barrier();
                if old_export || exported {
                    self.shared.export.mark_dirty();
                }
                // 変更通知はバリアのコールバックが出す。バリアが走らなかったときだけ直接反応する
                let reported = changes.iter().any(|c| c.key == key);
                self.apply_universal_changes(changes);
                if !reported {
                    self.react_to_variable_change(key);
                }
            }
            Target::Node(id) => {
                let mut arena = self.arena();
                let node = arena.node_mut(id);
                let entry = node.find_or_create_entry(key);
                let was_exported = entry.exported;
                let exported = explicit_export.unwrap_or(was_exported && !mode.intersects(EnvMode::LOCAL | EnvMode::GLOBAL));
                entry.val = val.to_string();
                entry.exported = exported;
                if exported {
                    node.exportv = true;
                }
                drop(arena);
                if was_exported || exported {
                    self.shared.export.mark_dirty();
                }
                self.shared.events.fire(&Event::variable("SET", key));
                self.react_to_variable_change(key);
            }
        }
        Ok(())
    }

    /// スコープ指定なしの `set` の行き先を決める。
    fn choose_target(&self, key: &str, mode: EnvMode, explicit_export: Option<bool>) -> Target {
        {
            let arena = self.arena();
            if mode.contains(EnvMode::GLOBAL) {
                return Target::Node(GLOBAL);
            }
            if mode.contains(EnvMode::LOCAL) {
                return Target::Node(self.top);
            }
            if let Some(id) = self.find_node(&arena, key) {
                return Target::Node(id);
            }
        }

        // 既存の変数がなければ、同名のユニバーサル変数へ書き込む
        let changes = self.shared.universal.barrier_once();
        self.apply_universal_changes(changes);
        let store = self.shared.universal.store();
        if store.get(key).is_some() {
            return Target::Universal { exported: explicit_export.unwrap_or(store.get_export(key)) };
        }

        let arena = self.arena();
        Target::Node(self.innermost_scope(&arena))
    }

    /// 変数を削除する。
    pub fn remove(&self, key: &str, mode: EnvMode) -> Result<(), EnvError> {
        if mode.contains(EnvMode::USER) && self.is_read_only(key) {
            return Err(EnvError::Permission(key.to_string()));
        }

        let mut erased = false;
        if !mode.contains(EnvMode::UNIVERSAL) {
            let first = if mode.contains(EnvMode::GLOBAL) { GLOBAL } else { self.top };
            let mut arena = self.arena();
            let removed = self.try_remove(&mut arena, first, key, mode);
            drop(arena);
            if let Some(entry) = removed {
                if entry.exported {
                    self.shared.export.mark_dirty();
                }
                self.shared.events.fire(&Event::variable("ERASE", key));
                erased = true;
            }
        }

        if !erased && !mode.intersects(EnvMode::GLOBAL | EnvMode::LOCAL) {
            erased = self.shared.universal.store().remove(key);
            if erased {
                let changes = self.shared.universal.barrier();
                self.apply_universal_changes(changes);
            }
        }

        self.react_to_variable_change(key);
        if erased {
            Ok(())
        } else {
            Err(EnvError::NotFound(key.to_string()))
        }
    }

    fn try_remove(&self, arena: &mut Arena, first: NodeId, key: &str, mode: EnvMode) -> Option<VarEntry> {
        let mut cursor = Some(first);
        while let Some(id) = cursor {
            if let Some(entry) = arena.node_mut(id).remove_entry(key) {
                return Some(entry);
            }
            if mode.contains(EnvMode::LOCAL) {
                return None;
            }
            cursor = arena.next_scope(id);
        }
        None
    }

    // ── スコープ ──

    /// スコープを積む。`new_scope` なら関数呼び出し相当の境界になる。
    pub fn push(&mut self, new_scope: bool) {
        let mut arena = self.arena();
        // 境界の内側にあったエクスポート変数が見えなくなる
        if new_scope && arena.local_scope_exports(self.top) {
            self.shared.export.mark_dirty();
        }
        let id = arena.alloc(self.top, new_scope);
        drop(arena);
        self.top = id;
    }

    /// スコープを 1 つ降ろす。グローバルノードの pop は致命的な不整合。
    pub fn pop(&mut self) {
        assert!(
            self.boundary != Some(self.top),
            "popped past the environment stack boundary"
        );
        let mut arena = self.arena();
        if self.top == GLOBAL {
            drop(arena);
            tracing::error!("tried to pop empty environment stack");
            std::process::abort();
        }

        let killed = self.top;
        let node = arena.node(killed);
        let locale_changed = node.vars.keys().any(|k| is_locale_var(k));
        let mut exports_changed = node.vars.values().any(|e| e.exported);
        if node.new_scope {
            // 境界の外側のエクスポート変数が再び見えるようになる
            let parent_exports = node.parent.is_some_and(|p| arena.local_scope_exports(p));
            exports_changed |= node.exportv || parent_exports;
        }
        let parent = node.parent.unwrap_or(GLOBAL);
        arena.retain(parent);
        arena.release(killed);
        drop(arena);
        self.top = parent;

        if exports_changed {
            self.shared.export.mark_dirty();
        }
        if locale_changed {
            self.handle_locale();
        }
    }

    /// 名前の一覧。スコープ指定がなければローカル・グローバル・ユニバーサルすべて。
    pub fn get_names(&self, mode: EnvMode) -> Vec<String> {
        let mut show_local = mode.contains(EnvMode::LOCAL);
        let mut show_global = mode.contains(EnvMode::GLOBAL);
        let mut show_universal = mode.contains(EnvMode::UNIVERSAL);
        if !show_local && !show_global && !show_universal {
            show_local = true;
            show_global = true;
            show_universal = true;
        }
        let (want_exported, want_unexported) = mode.export_filter();
        let keep = |e: &VarEntry| if e.exported { want_exported } else { want_unexported };

        let mut names = BTreeSet::new();
        {
            let arena = self.arena();
            if show_local {
                let mut id = self.top;
                while id != GLOBAL {
                    let node = arena.node(id);
                    names.extend(node.vars.iter().filter(|(_, e)| keep(e)).map(|(k, _)| k.clone()));
                    if node.new_scope {
                        break;
                    }
                    match node.parent {
                        Some(p) => id = p,
                        None => break,
                    }
                }
            }
            if show_global {
                let global = arena.node(GLOBAL);
                names.extend(global.vars.iter().filter(|(_, e)| keep(e)).map(|(k, _)| k.clone()));
                if want_unexported {
                    names.extend(ELECTRIC.iter().map(|s| s.to_string()));
                }
            }
        }
        if show_universal {
            let store = self.shared.universal.store();
            names.extend(store.get_names(want_exported, want_unexported));
        }
        names.into_iter().collect()
    }

    // ── 反応処理 ──

    /// 同期バリアで届いた変更を通知する。ロックを持たずに呼ぶ。
    pub(crate) fn apply_universal_changes(&self, changes: Vec<UniversalChange>) {
        for change in changes {
            self.shared.export.mark_dirty();
            self.shared.events.fire(&Event::variable(change.kind.as_str(), &change.key));
            self.react_to_variable_change(&change.key);
        }
    }

    /// 変数ごとの固定の反応処理。
    fn react_to_variable_change(&self, key: &str) {
        if is_locale_var(key) {
            self.handle_locale();
        } else if key == "rush_term256" || key == "rush_term24bit" {
            let term256 = self.get("rush_term256", EnvMode::DEFAULT).is_some_and(|v| is_truthy(&v));
            let term24bit = self.get("rush_term24bit", EnvMode::DEFAULT).is_some_and(|v| is_truthy(&v));
            self.shared.display.color_support_changed(term256, term24bit);
            self.shared.display.colors_changed();
        } else if key.starts_with(COLOR_PREFIX) {
            self.shared.display.colors_changed();
        }
    }

    /// ロケール変数からプロセスのロケールを設定し直す。
    fn handle_locale(&self) {
        let old = current_locale(libc::LC_MESSAGES);
        if let Some(all) = self.get("LC_ALL", EnvMode::DEFAULT) {
            apply_locale(libc::LC_ALL, &all);
        } else {
            if let Some(lang) = self.get("LANG", EnvMode::DEFAULT) {
                apply_locale(libc::LC_ALL, &lang);
            }
            for (name, category) in LOCALE_CATEGORIES {
                if let Some(val) = self.get(name, EnvMode::DEFAULT) {
                    apply_locale(*category, &val);
                }
            }
        }
        let new = current_locale(libc::LC_MESSAGES);
        if old != new {
            tracing::debug!(from = %old, to = %new, "message locale changed");
            self.shared.display.locale_changed(&new);
        }
    }

    // ── 初期化 ──

    /// 起動時の初期化。親プロセスの環境変数を取り込み、既定値を補い、
    /// 最後にコマンドライン用の永続ローカルスコープを積む。
    pub fn init<I>(&mut self, environ: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let global_export = EnvMode::GLOBAL | EnvMode::EXPORT;
        for (key, mut val) in environ {
            if key.is_empty() || self.is_read_only(&key) || is_electric(&key) {
                continue;
            }
            if is_colon_delimited(&key) {
                val = val.replace(':', &ARRAY_SEP.to_string());
            }
            self.set_or_warn(&key, Some(&val), global_export);
        }

        if self.get("PATH", EnvMode::DEFAULT).map_or(true, |p| p.is_empty()) {
            let path = format!("/usr/bin{}/bin", ARRAY_SEP);
            self.set_or_warn("PATH", Some(&path), global_export);
        }

        if self.get("USER", EnvMode::DEFAULT).map_or(true, |u| u.is_empty()) {
            if let Some(name) = passwd_name_for_uid() {
                self.set_or_warn("USER", Some(&name), global_export);
            }
        }

        let version = env!("CARGO_PKG_VERSION");
        self.set_or_warn("version", Some(version), EnvMode::GLOBAL);
        self.set_or_warn("RUSH_VERSION", Some(version), EnvMode::GLOBAL);

        let shlvl = self
            .get("SHLVL", EnvMode::DEFAULT)
            .and_then(|s| s.trim_end().parse::<i64>().ok())
            .filter(|n| *n >= 0)
            .map_or(1, |n| n + 1);
        self.set_or_warn("SHLVL", Some(&shlvl.to_string()), global_export);
        self.shared.shlvl_read_only.store(true, Ordering::Release);

        if self.get("HOME", EnvMode::DEFAULT).map_or(true, |h| h.is_empty()) {
            let user = self.get("USER", EnvMode::DEFAULT).unwrap_or_default();
            if let Some(dir) = passwd_home_for_name(&user) {
                self.set_or_warn("HOME", Some(&dir), global_export);
            }
        }

        self.set_pwd();
        self.push(false);
    }

    fn set_or_warn(&self, key: &str, val: Option<&str>, mode: EnvMode) {
        if let Err(e) = self.set(key, val, mode) {
            tracing::warn!(error = e.as_label(), "{}", e);
        }
    }

    /// カレントディレクトリを `PWD` に設定する。取得できなければ `false`。
    pub fn set_pwd(&self) -> bool {
        match std::env::current_dir() {
            Ok(dir) => {
                let dir = dir.to_string_lossy();
                self.set_or_warn("PWD", Some(&dir), EnvMode::EXPORT | EnvMode::GLOBAL);
                true
            }
            Err(e) => {
                tracing::debug!("getcwd failed: {}", e);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn live_nodes(&self) -> usize {
        self.arena().live_nodes()
    }
}

impl Drop for EnvStack {
    fn drop(&mut self) {
        let mut arena = self.arena();
        arena.release(self.top);
        if let Some(boundary) = self.boundary {
            arena.release(boundary);
        }
    }
}

impl Environment for EnvStack {
    fn get(&self, key: &str, mode: EnvMode) -> Option<String> {
        EnvStack::get(self, key, mode)
    }

    fn get_names(&self, mode: EnvMode) -> Vec<String> {
        EnvStack::get_names(self, mode)
    }
}

// ── ヘルパー ─────────────────────────────────────────────────────────

/// 連続する `/` をまとめ、末尾の `/` を取り除く（ルートを除く）。
pub fn canonical_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    while out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// 8 進文字列を umask 値として解釈する。全体が 8 進数字で `0..=0o777` のときだけ有効。
pub fn parse_umask(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| (b'0'..=b'7').contains(&b)) {
        return None;
    }
    u32::from_str_radix(s, 8).ok().filter(|m| *m <= 0o777)
}

fn current_umask() -> u32 {
    unsafe {
        let mask = libc::umask(0);
        libc::umask(mask);
        mask as u32
    }
}

/// 端末の `(列数, 行数)`。取得できなければ 80x24。
fn terminal_size() -> (u16, u16) {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let ok = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) } == 0;
    if ok && ws.ws_col > 0 && ws.ws_row > 0 {
        (ws.ws_col, ws.ws_row)
    } else {
        (80, 24)
    }
}

fn is_truthy(s: &str) -> bool {
    matches!(s.trim(), "1" | "true" | "yes" | "on")
        || s.trim().parse::<i64>().is_ok_and(|n| n != 0)
}

fn current_locale(category: libc::c_int) -> String {
    let ptr = unsafe { libc::setlocale(category, std::ptr::null()) };
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

fn apply_locale(category: libc::c_int, value: &str) {
    let Ok(c) = CString::new(value) else {
        return;
    };
    if unsafe { libc::setlocale(category, c.as_ptr()) }.is_null() {
        tracing::debug!(locale = value, "setlocale rejected locale");
    }
}

fn passwd_name_for_uid() -> Option<String> {
    let pw = unsafe { libc::getpwuid(libc::getuid()) };
    if pw.is_null() {
        return None;
    }
    let name = unsafe { (*pw).pw_name };
    if name.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
}

fn passwd_home_for_name(user: &str) -> Option<String> {
    let c = CString::new(user).ok()?;
    let pw = unsafe { libc::getpwnam(c.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let dir = unsafe { (*pw).pw_dir };
    if dir.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(dir) }.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, RecordingSink};

    fn stack() -> EnvStack {
        EnvStack::new(EnvCollaborators::default())
    }

    fn recording_stack() -> (EnvStack, Arc<RecordingSink>, Arc<MemoryUniversalStore>) {
        let events = Arc::new(RecordingSink::new());
        let universal = Arc::new(MemoryUniversalStore::new());
        let stack = EnvStack::new(EnvCollaborators {
            universal: universal.clone(),
            events: events.clone(),
            display: Arc::new(NoDisplay),
        });
        (stack, events, universal)
    }

    #[test]
    fn umask_is_electric() {
        let env = stack();
        let saved = current_umask();
        env.set("umask", Some("027"), EnvMode::DEFAULT).unwrap();
        assert_eq!(env.get("umask", EnvMode::DEFAULT).as_deref(), Some("0027"));
        env.set("umask", Some("0"), EnvMode::DEFAULT).unwrap();
        assert_eq!(env.get("umask", EnvMode::DEFAULT).as_deref(), Some("0000"));
        // 変数としては保存されない
        assert!(env.arena().node(GLOBAL).find_entry("umask").is_none());
        unsafe { libc::umask(saved as libc::mode_t) };
    }

    #[test]
    fn umask_rejects_malformed_values() {
        let env = stack();
        for bad in ["", "8", "0o22", "1000", "22x", "-1", "+22"] {
            assert_eq!(
                env.set("umask", Some(bad), EnvMode::DEFAULT),
                Err(EnvError::Invalid("umask".into())),
                "{bad:?}"
            );
        }
        assert_eq!(env.set("umask", None, EnvMode::DEFAULT), Err(EnvError::Invalid("umask".into())));
    }

    #[test]
    fn scope_isolation_round_trip() {
        let mut env = stack();
        env.set("x", Some("outer"), EnvMode::GLOBAL).unwrap();
        env.push(true);
        env.set("x", Some("inner"), EnvMode::LOCAL).unwrap();
        env.set("y", Some("only-inner"), EnvMode::LOCAL).unwrap();
        assert_eq!(env.get("x", EnvMode::DEFAULT).as_deref(), Some("inner"));
        env.pop();
        assert_eq!(env.get("x", EnvMode::DEFAULT).as_deref(), Some("outer"));
        assert_eq!(env.get("y", EnvMode::DEFAULT), None);
    }

    #[test]
    fn boundary_hides_caller_locals() {
        let mut env = stack();
        env.push(false);
        env.set("caller", Some("1"), EnvMode::LOCAL).unwrap();
        env.push(false);
        // 透過スコープからは見える
        assert_eq!(env.get("caller", EnvMode::DEFAULT).as_deref(), Some("1"));
        env.push(true);
        // 関数スコープからは見えない
        assert_eq!(env.get("caller", EnvMode::DEFAULT), None);
        assert!(!env.exist("caller", EnvMode::DEFAULT));
        env.pop();
        env.pop();
        env.pop();
    }

    #[test]
    fn export_filter_sees_outer_global() {
        let mut env = stack();
        env.set("k", Some("outer"), EnvMode::GLOBAL | EnvMode::EXPORT).unwrap();

        env.push(false);
        env.set("k", Some("inner"), EnvMode::LOCAL | EnvMode::UNEXPORT).unwrap();
        assert_eq!(
            env.get("k", EnvMode::GLOBAL | EnvMode::EXPORT).as_deref(),
            Some("outer")
        );
        // スコープ指定なしでは内側の非エクスポート値が先に見つかる
        assert_eq!(env.get("k", EnvMode::DEFAULT).as_deref(), Some("inner"));
        env.pop();

        env.push(true);
        env.set("k", Some("fn"), EnvMode::LOCAL | EnvMode::UNEXPORT).unwrap();
        assert_eq!(
            env.get("k", EnvMode::GLOBAL | EnvMode::EXPORT).as_deref(),
            Some("outer")
        );
        assert_eq!(env.get("k", EnvMode::LOCAL).as_deref(), Some("fn"));
        env.pop();
    }

    #[test]
    fn local_only_lookup_checks_top_node() {
        let mut env = stack();
        env.push(false);
        env.set("a", Some("1"), EnvMode::LOCAL).unwrap();
        env.push(false);
        assert_eq!(env.get("a", EnvMode::LOCAL), None);
        assert_eq!(env.get("a", EnvMode::DEFAULT).as_deref(), Some("1"));
        env.pop();
        env.pop();
    }

    #[test]
    fn unscoped_set_updates_existing_entry_in_place() {
        let mut env = stack();
        env.set("v", Some("g"), EnvMode::GLOBAL | EnvMode::EXPORT).unwrap();
        env.push(true);
        env.set("v", Some("changed"), EnvMode::DEFAULT).unwrap();
        env.pop();
        // 関数内からでもグローバルの既存変数が書き換わり、エクスポートも保たれる
        assert_eq!(env.get("v", EnvMode::GLOBAL | EnvMode::EXPORT).as_deref(), Some("changed"));
    }

    #[test]
    fn new_unscoped_variable_lands_in_innermost_function_scope() {
        let mut env = stack();
        env.push(true);
        env.push(false);
        env.set("fresh", Some("1"), EnvMode::DEFAULT).unwrap();
        env.pop();
        // 透過ブロックを抜けても関数スコープに残る
        assert_eq!(env.get("fresh", EnvMode::DEFAULT).as_deref(), Some("1"));
        env.pop();
        assert_eq!(env.get("fresh", EnvMode::DEFAULT), None);
    }

    #[test]
    fn empty_array_exists_but_has_no_value() {
        let env = stack();
        env.set("empty", None, EnvMode::GLOBAL).unwrap();
        assert_eq!(env.get("empty", EnvMode::DEFAULT), None);
        assert!(env.exist("empty", EnvMode::DEFAULT));
        assert!(!env.exist("missing", EnvMode::DEFAULT));
    }

    #[test]
    fn read_only_and_electric_rules() {
        let env = stack();
        assert_eq!(
            env.set("status", Some("1"), EnvMode::LOCAL),
            Err(EnvError::Scope("status".into()))
        );
        assert_eq!(
            env.set("umask", Some("022"), EnvMode::EXPORT),
            Err(EnvError::Scope("umask".into()))
        );
        assert_eq!(
            env.set("PWD", Some("/"), EnvMode::USER),
            Err(EnvError::Permission("PWD".into()))
        );
        assert_eq!(
            env.remove("PWD", EnvMode::USER),
            Err(EnvError::Permission("PWD".into()))
        );
        assert_eq!(
            env.remove("nothing_here", EnvMode::USER),
            Err(EnvError::NotFound("nothing_here".into()))
        );
        // シェル内部からの設定は許される
        env.set("PWD", Some("/tmp"), EnvMode::GLOBAL | EnvMode::EXPORT).unwrap();
    }

    #[test]
    fn electric_variables_exist_only_globally_unexported() {
        let env = stack();
        assert!(env.exist("status", EnvMode::DEFAULT));
        assert!(!env.exist("status", EnvMode::LOCAL));
        assert!(!env.exist("status", EnvMode::EXPORT));
        assert_eq!(env.get("status", EnvMode::LOCAL), None);
        env.set_last_status(3);
        assert_eq!(env.get("status", EnvMode::DEFAULT).as_deref(), Some("3"));
    }

    #[test]
    fn history_is_newest_first() {
        let env = stack();
        env.add_history("ls");
        env.add_history("pwd");
        let expected = format!("pwd{}ls", ARRAY_SEP);
        assert_eq!(env.get("history", EnvMode::DEFAULT), Some(expected));
    }

    #[test]
    fn pwd_is_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_string_lossy().into_owned();
        let env = stack();
        let messy = format!("{}//", path.replace('/', "//"));
        env.set("PWD", Some(&messy), EnvMode::GLOBAL | EnvMode::EXPORT).unwrap();
        assert_eq!(env.get("PWD", EnvMode::DEFAULT), Some(path.clone()));
        assert_eq!(pwd_slash(&env), format!("{}/", path));
        assert_eq!(canonical_path("/"), "/");
    }

    #[test]
    fn set_and_erase_fire_events_in_order() {
        let (env, events, _) = recording_stack();
        env.set("foo", Some("1"), EnvMode::GLOBAL).unwrap();
        env.remove("foo", EnvMode::DEFAULT).unwrap();
        let got = events.take();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind, EventKind::Variable("foo".into()));
        assert_eq!(got[0].args, vec!["VARIABLE", "SET", "foo"]);
        assert_eq!(got[1].args, vec!["VARIABLE", "ERASE", "foo"]);
    }

    #[test]
    fn unscoped_set_writes_through_to_existing_universal() {
        let (env, events, store) = recording_stack();
        env.set("uvar", Some("1"), EnvMode::UNIVERSAL).unwrap();
        env.set("uvar", Some("2"), EnvMode::DEFAULT).unwrap();
        // ローカル・グローバルには作られず、ユニバーサル側が書き換わる
        assert_eq!(store.get("uvar").as_deref(), Some("2"));
        assert!(!env.exist("uvar", EnvMode::LOCAL | EnvMode::GLOBAL));
        assert_eq!(env.get("uvar", EnvMode::DEFAULT).as_deref(), Some("2"));
        // ユニバーサルへの書き込みはバリア経由で通知される
        let sets = events
            .take()
            .into_iter()
            .filter(|e| e.args == vec!["VARIABLE", "SET", "uvar"])
            .count();
        assert_eq!(sets, 2);
    }

    #[test]
    fn remove_falls_back_to_universal() {
        let (env, _, store) = recording_stack();
        env.set("u", Some("x"), EnvMode::UNIVERSAL | EnvMode::EXPORT).unwrap();
        assert_eq!(
            env.remove("u", EnvMode::GLOBAL),
            Err(EnvError::NotFound("u".into()))
        );
        env.remove("u", EnvMode::DEFAULT).unwrap();
        assert_eq!(store.get("u"), None);
    }

    #[test]
    fn universal_export_flag_is_preserved_without_override() {
        let (env, _, store) = recording_stack();
        env.set("EDITOR", Some("vi"), EnvMode::UNIVERSAL | EnvMode::EXPORT).unwrap();
        env.set("EDITOR", Some("vim"), EnvMode::UNIVERSAL).unwrap();
        assert!(store.get_export("EDITOR"));
        assert_eq!(env.get("EDITOR", EnvMode::EXPORT).as_deref(), Some("vim"));
        env.set("EDITOR", Some("nano"), EnvMode::UNIVERSAL | EnvMode::UNEXPORT).unwrap();
        assert_eq!(env.get("EDITOR", EnvMode::EXPORT), None);
    }

    #[test]
    fn names_union_scopes_and_electric() {
        let mut env = stack();
        env.set("g", Some("1"), EnvMode::GLOBAL).unwrap();
        env.set("U", Some("1"), EnvMode::UNIVERSAL).unwrap();
        env.push(true);
        env.set("l", Some("1"), EnvMode::LOCAL | EnvMode::EXPORT).unwrap();

        let all = env.get_names(EnvMode::DEFAULT);
        for name in ["g", "U", "l", "status", "umask"] {
            assert!(all.iter().any(|n| n == name), "{name} missing");
        }
        let exported = env.get_names(EnvMode::EXPORT);
        assert_eq!(exported, vec!["l"]);
        let local = env.get_names(EnvMode::LOCAL);
        assert_eq!(local, vec!["l"]);
        env.pop();
    }

    #[test]
    fn names_are_deduplicated_against_electric() {
        let env = stack();
        env.set("COLUMNS", Some("80"), EnvMode::GLOBAL).unwrap();
        let all = env.get_names(EnvMode::DEFAULT);
        assert_eq!(all.iter().filter(|n| *n == "COLUMNS").count(), 1);
        let mut sorted = all.clone();
        sorted.dedup();
        assert_eq!(sorted, all);
    }

    #[test]
    fn child_stack_shares_globals_and_stops_at_boundary() {
        let mut env = stack();
        env.push(false);
        env.set("outer_local", Some("1"), EnvMode::LOCAL).unwrap();
        let before = env.live_nodes();
        {
            let mut child = env.child();
            assert_eq!(child.get("outer_local", EnvMode::DEFAULT).as_deref(), Some("1"));
            child.push(true);
            child.set("g", Some("from child"), EnvMode::GLOBAL).unwrap();
            child.set("mine", Some("1"), EnvMode::LOCAL).unwrap();
            // 親が起点のノードを降ろしても子は使い続けられる
            env.pop();
            assert_eq!(child.get("mine", EnvMode::DEFAULT).as_deref(), Some("1"));
            child.pop();
            assert_eq!(child.get("outer_local", EnvMode::DEFAULT).as_deref(), Some("1"));
        }
        assert_eq!(env.get("g", EnvMode::DEFAULT).as_deref(), Some("from child"));
        assert_eq!(env.get("outer_local", EnvMode::DEFAULT), None);
        // 子が消えれば降ろされたノードも解放される
        assert_eq!(env.live_nodes(), before - 1);
    }

    #[test]
    #[should_panic(expected = "past the environment stack boundary")]
    fn child_cannot_pop_past_boundary() {
        let env = stack();
        let mut child = env.child();
        child.pop();
    }

    #[test]
    fn init_imports_environment() {
        let mut env = stack();
        let vars = vec![
            ("PATH".to_string(), "/bin:/usr/bin".to_string()),
            ("SHLVL".to_string(), "2".to_string()),
            ("status".to_string(), "99".to_string()),
            ("FOO".to_string(), "bar".to_string()),
        ];
        env.init(vars);
        let path = env.get("PATH", EnvMode::DEFAULT).unwrap();
        assert_eq!(path, format!("/bin{}/usr/bin", ARRAY_SEP));
        assert_eq!(env.get("SHLVL", EnvMode::DEFAULT).as_deref(), Some("3"));
        assert!(env.is_read_only("SHLVL"));
        assert_eq!(env.get("status", EnvMode::DEFAULT).as_deref(), Some("0"));
        assert_eq!(env.get("FOO", EnvMode::GLOBAL | EnvMode::EXPORT).as_deref(), Some("bar"));
        assert!(env.get("PWD", EnvMode::DEFAULT).is_some());
        // 永続ローカルスコープへの `set -l` はグローバルに漏れない
        env.set("tmp", Some("1"), EnvMode::LOCAL).unwrap();
        assert_eq!(env.get("tmp", EnvMode::GLOBAL), None);
    }

    #[test]
    fn init_supplies_default_path() {
        let mut env = stack();
        env.init(Vec::new());
        let expected = format!("/usr/bin{}/bin", ARRAY_SEP);
        assert_eq!(env.get("PATH", EnvMode::DEFAULT), Some(expected));
        assert_eq!(env.get("SHLVL", EnvMode::DEFAULT).as_deref(), Some("1"));
    }

    #[test]
    fn snapshot_copies_selected_keys() {
        let env = stack();
        env.set("PATH", Some("/bin"), EnvMode::GLOBAL | EnvMode::EXPORT).unwrap();
        let snap = EnvSnapshot::new(&env, EnvSnapshot::HIGHLIGHTING_KEYS);
        env.set("PATH", Some("/other"), EnvMode::GLOBAL).unwrap();
        assert_eq!(snap.get("PATH", EnvMode::DEFAULT).as_deref(), Some("/bin"));
        assert_eq!(snap.get_names(EnvMode::DEFAULT), vec!["PATH"]);
    }

    #[test]
    fn color_variables_notify_display() {
        use std::sync::atomic::AtomicUsize;

        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl DisplayHooks for Counting {
            fn colors_changed(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let display = Arc::new(Counting::default());
        let env = EnvStack::new(EnvCollaborators {
            display: display.clone(),
            ..EnvCollaborators::default()
        });
        env.set("rush_color_command", Some("blue"), EnvMode::GLOBAL).unwrap();
        env.set("rush_term256", Some("1"), EnvMode::GLOBAL).unwrap();
        env.set("unrelated", Some("1"), EnvMode::GLOBAL).unwrap();
        assert_eq!(display.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn universal_color_change_notifies_display_once() {
        use std::sync::atomic::AtomicUsize;

        #[derive(Default)]
        struct Counting(AtomicUsize);
        impl DisplayHooks for Counting {
            fn colors_changed(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let display = Arc::new(Counting::default());
        let env = EnvStack::new(EnvCollaborators {
            display: display.clone(),
            ..EnvCollaborators::default()
        });
        env.set("rush_color_error", Some("red"), EnvMode::UNIVERSAL).unwrap();
        assert_eq!(display.0.load(Ordering::SeqCst), 1);
        env.set("rush_color_error", Some("brred"), EnvMode::DEFAULT).unwrap();
        assert_eq!(display.0.load(Ordering::SeqCst), 2);
    }
}
