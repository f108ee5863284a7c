//! 実行コンテキスト: ブロックスタック・ジョブリスト・変数スタックの持ち主。
//!
//! 構文木の評価そのものは [`Evaluator`] に任せ、ここでは評価の前後処理を受け持つ。
//!
//! - ブロックの積み降ろしと変数スコープの対応付け（[`Parser::push_block`] / [`Parser::pop_block`]）
//! - バックトレースの組み立て（[`Parser::stack_trace`]）
//! - トップレベル評価の前後のジョブ回収とキャンセル処理（[`Parser::eval`]）
//! - ワーカースレッドでの子パーサー評価（[`Parser::eval_in_child`]）

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use libc::pid_t;

use crate::block::{Block, BlockKind, LoopStatus};
use crate::context::ShellContext;
use crate::env::{EnvMode, EnvStack};
use crate::io::IoChain;
use crate::job::{EmulatedProcess, Job, JobList};
use crate::job_id::JobId;
use crate::proc;

// ── 協調相手 ─────────────────────────────────────────────────────────

/// 関数定義の所在。バックトレースと行番号の計算に使う。
pub trait FunctionLookup: Send + Sync {
    /// 関数を定義したファイル。標準入力などで定義されたなら `None`。
    fn definition_file(&self, name: &str) -> Option<String>;
    /// 関数本体の先頭行のオフセット。
    fn definition_offset(&self, name: &str) -> i32;
}

/// 関数名 → 定義位置の表。
#[derive(Debug, Default)]
pub struct FunctionTable {
    defs: Mutex<HashMap<String, (Option<String>, i32)>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: &str, file: Option<&str>, offset: i32) {
        self.defs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), (file.map(str::to_string), offset));
    }
}

impl FunctionLookup for FunctionTable {
    fn definition_file(&self, name: &str) -> Option<String> {
        let defs = self.defs.lock().unwrap_or_else(PoisonError::into_inner);
        defs.get(name).and_then(|(file, _)| file.clone())
    }

    fn definition_offset(&self, name: &str) -> i32 {
        let defs = self.defs.lock().unwrap_or_else(PoisonError::into_inner);
        defs.get(name).map_or(0, |(_, offset)| *offset)
    }
}

/// スクリプト断片の評価器。
///
/// [`Parser::eval`] がスコープブロックを積んだ状態で呼ぶ。
/// 戻り値は評価結果のステータスで、`$status` の更新は評価器側で行う。
pub trait Evaluator: Send + Sync {
    fn eval(&self, parser: &mut Parser, src: &str, io: &IoChain) -> i32;
}

// ── パーサー ─────────────────────────────────────────────────────────

pub struct Parser {
    ctx: Arc<ShellContext>,
    pub(crate) vars: EnvStack,
    pub(crate) jobs: JobList,
    /// 末尾がスタックトップ。
    blocks: Vec<Block>,
    functions: Arc<dyn FunctionLookup>,
    evaluator: Arc<dyn Evaluator>,
    interactive_filenames: Vec<String>,
    is_interactive_stack: Vec<bool>,
    is_event: usize,
    is_subshell: usize,
    within_initialization: bool,
    /// 評価中の行番号。評価器が更新する。
    lineno: Option<i32>,
    /// `job_reap` の再入防止。同一スレッド内の再帰だけを防ぐ。
    pub(crate) reaping: bool,
    pub last_bg_pid: pid_t,
}

impl Parser {
    pub fn new(ctx: Arc<ShellContext>, vars: EnvStack, evaluator: Arc<dyn Evaluator>) -> Self {
        Parser {
            ctx,
            vars,
            jobs: JobList::new(),
            blocks: Vec::new(),
            functions: Arc::new(FunctionTable::new()),
            evaluator,
            interactive_filenames: Vec::new(),
            is_interactive_stack: Vec::new(),
            is_event: 0,
            is_subshell: 0,
            within_initialization: false,
            lineno: None,
            reaping: false,
            last_bg_pid: -1,
        }
    }

    pub fn with_functions(mut self, functions: Arc<dyn FunctionLookup>) -> Self {
        self.functions = functions;
        self
    }

    pub fn ctx(&self) -> &Arc<ShellContext> {
        &self.ctx
    }

    pub fn vars(&self) -> &EnvStack {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut EnvStack {
        &mut self.vars
    }

    pub fn jobs(&self) -> &JobList {
        &self.jobs
    }

    pub fn last_status(&self) -> i32 {
        self.vars.last_status()
    }

    pub fn set_last_status(&self, status: i32) {
        self.vars.set_last_status(status);
    }

    // ── ブロックスタック ──

    /// ブロックを積む。
    ///
    /// skip 状態は外側のブロックから引き継ぐ。ただしトップレベルとコマンド置換は
    /// 常に評価し、関数定義と fake ブロックは常に飛ばす。
    /// 関数定義・fake・トップレベル以外は変数スコープも積む。
    pub fn push_block(&mut self, mut block: Block) {
        block.src_lineno = self.get_lineno();
        block.src_filename = self.current_filename();
        block.skip = self.current_block().is_some_and(|b| b.skip);
        match block.kind {
            BlockKind::Top | BlockKind::Subst => block.skip = false,
            BlockKind::Fake | BlockKind::FunctionDef => block.skip = true,
            _ => {}
        }
        block.loop_status = LoopStatus::Normal;

        if block.kind.wants_env_scope() {
            self.vars.push(block.kind.opens_new_scope());
            block.wants_pop_env = true;
        }
        tracing::trace!(block = block.description(), depth = self.blocks.len() + 1, "push block");
        self.blocks.push(block);
    }

    /// ブロックを 1 つ降ろし、対応する変数スコープがあればそれも降ろす。
    pub fn pop_block(&mut self) -> Option<Block> {
        let Some(block) = self.blocks.pop() else {
            tracing::error!("pop_block called on empty block stack");
            return None;
        };
        if block.wants_pop_env {
            self.vars.pop();
        }
        Some(block)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// 上から `idx` 番目のブロック（0 がトップ）。
    pub fn block_at_index(&self, idx: usize) -> Option<&Block> {
        self.blocks.iter().rev().nth(idx)
    }

    pub fn block_at_index_mut(&mut self, idx: usize) -> Option<&mut Block> {
        self.blocks.iter_mut().rev().nth(idx)
    }

    pub fn current_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    pub fn current_block_mut(&mut self) -> Option<&mut Block> {
        self.blocks.last_mut()
    }

    /// トップレベル・コマンド置換以外のブロックが積まれているか。
    pub fn block_is_on_stack(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| !matches!(b.kind, BlockKind::Top | BlockKind::Subst))
    }

    /// キャンセル要求を立て、積まれているすべてのブロックを skip にする。
    pub fn skip_all_blocks(&mut self) {
        self.ctx.request_cancellation();
        for block in &mut self.blocks {
            block.skip = true;
        }
        tracing::debug!(blocks = self.blocks.len(), "cancelling blocks");
    }

    /// スタックを底から順に、1 段ごとに字下げして並べる。
    pub fn block_stack_description(&self) -> String {
        let mut result = String::new();
        for (depth, block) in self.blocks.iter().enumerate() {
            if depth > 0 {
                result.push('\n');
            }
            result.extend(std::iter::repeat(' ').take(depth));
            result.push_str(block.description());
        }
        result
    }

    // ── 位置情報 ──

    /// 実行中の関数名。ソースファイルを挟んだ外側の関数は数えない。
    pub fn is_function(&self) -> Option<String> {
        for block in self.blocks.iter().rev() {
            match &block.kind {
                BlockKind::FunctionCall { name, .. } => return Some(name.clone()),
                BlockKind::Source { .. } => return None,
                _ => {}
            }
        }
        None
    }

    /// 現在の行番号。関数内なら定義位置のオフセットを足す。不明なら -1。
    pub fn get_lineno(&self) -> i32 {
        let Some(lineno) = self.lineno else {
            return -1;
        };
        match self.is_function() {
            Some(name) => lineno + self.functions.definition_offset(&name),
            None => lineno,
        }
    }

    pub fn set_lineno(&mut self, lineno: Option<i32>) {
        self.lineno = lineno;
    }

    /// 現在評価中のファイル。関数の定義ファイル、読み込み中のファイル、
    /// 対話ファイル名の順に探す。
    pub fn current_filename(&self) -> Option<String> {
        for block in self.blocks.iter().rev() {
            match &block.kind {
                BlockKind::FunctionCall { name, .. } => {
                    return self.functions.definition_file(name);
                }
                BlockKind::Source { file } => return Some(file.clone()),
                _ => {}
            }
        }
        self.current_interactive_filename().map(str::to_string)
    }

    pub fn current_interactive_filename(&self) -> Option<&str> {
        self.interactive_filenames.last().map(String::as_str)
    }

    pub fn push_interactive_filename(&mut self, name: impl Into<String>) {
        self.interactive_filenames.push(name.into());
    }

    pub fn pop_interactive_filename(&mut self) {
        debug_assert!(!self.interactive_filenames.is_empty());
        self.interactive_filenames.pop();
    }

    /// 空のスタックは非対話。
    pub fn get_is_interactive(&self) -> bool {
        self.is_interactive_stack.last().copied().unwrap_or(false)
    }

    pub fn push_is_interactive(&mut self, interactive: bool) {
        self.is_interactive_stack.push(interactive);
    }

    pub fn pop_is_interactive(&mut self) {
        debug_assert!(!self.is_interactive_stack.is_empty());
        self.is_interactive_stack.pop();
    }

    pub fn push_is_event(&mut self) {
        self.is_event += 1;
    }

    pub fn pop_is_event(&mut self) {
        debug_assert!(self.is_event > 0);
        self.is_event = self.is_event.saturating_sub(1);
    }

    pub fn get_is_event(&self) -> bool {
        self.is_event > 0
    }

    pub fn push_is_subshell(&mut self) {
        self.is_subshell += 1;
    }

    pub fn pop_is_subshell(&mut self) {
        debug_assert!(self.is_subshell > 0);
        self.is_subshell = self.is_subshell.saturating_sub(1);
    }

    pub fn get_is_subshell(&self) -> bool {
        self.is_subshell > 0
    }

    pub fn set_is_within_initialization(&mut self, flag: bool) {
        self.within_initialization = flag;
    }

    /// ホームディレクトリを `~` に置き換える。
    pub fn user_presentable_path(&self, path: &str) -> String {
        match self.vars.get("HOME", EnvMode::DEFAULT) {
            Some(home) if !home.is_empty() && path.starts_with(&home) => {
                let rest = &path[home.len()..];
                if rest.is_empty() || rest.starts_with('/') {
                    format!("~{}", rest)
                } else {
                    path.to_string()
                }
            }
            _ => path.to_string(),
        }
    }

    // ── バックトレース ──

    /// 上から `block_idx` 番目以降のブロックについてバックトレースを追記する。
    ///
    /// 関数呼び出し・読み込みファイル・コマンド置換だけを出力し、
    /// イベントハンドラに達したらそこで止める。
    pub fn stack_trace(&self, block_idx: usize, buff: &mut String) {
        for block in self.blocks.iter().rev().skip(block_idx) {
            if let BlockKind::Event { event } = &block.kind {
                let _ = writeln!(buff, "in event handler: {}", event.description());
                buff.push('\n');
                return;
            }

            match &block.kind {
                BlockKind::Source { file } => {
                    let _ = writeln!(buff, "from sourcing file {}", self.user_presentable_path(file));
                }
                BlockKind::FunctionCall { name, .. } => {
                    let _ = writeln!(buff, "in function '{}'", name);
                }
                BlockKind::Subst => buff.push_str("in command substitution\n"),
                _ => continue,
            }

            match &block.src_filename {
                Some(file) => {
                    let _ = writeln!(
                        buff,
                        "\tcalled on line {} of file {}",
                        block.src_lineno,
                        self.user_presentable_path(file)
                    );
                }
                None if self.within_initialization => buff.push_str("\tcalled during startup\n"),
                None => buff.push_str("\tcalled on standard input\n"),
            }

            if let BlockKind::FunctionCall { args, shadows: true, .. } = &block.kind {
                if !args.is_empty() {
                    let _ = writeln!(buff, "\twith parameter list '{}'", args.join(" "));
                }
            }
            buff.push('\n');
        }
    }

    /// スタック全体のバックトレース。
    pub fn backtrace(&self) -> String {
        let mut buff = String::new();
        self.stack_trace(0, &mut buff);
        buff
    }

    // ── ジョブリスト ──

    pub fn job_add(&mut self, job: Job) {
        self.jobs.add(job);
    }

    /// ジョブを取り外す。見つからなければ不整合として警告する。
    pub fn job_remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(id);
        match &job {
            Some(job) => self.ctx.job_store.forget_job(job),
            None => tracing::warn!(job_id = id, "job inconsistency: removing unknown job"),
        }
        job
    }

    pub fn job_promote(&mut self, id: JobId) {
        if !self.jobs.promote(id) {
            tracing::warn!(job_id = id, "job inconsistency: promoting unknown job");
        }
    }

    /// `id <= 0` なら最も最近使われたジョブ。
    pub fn job_get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn job_get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn job_get_from_pid(&self, pgid: pid_t) -> Option<&Job> {
        self.jobs.get_from_pid(pgid)
    }

    // ── 評価 ──

    /// スクリプト断片を評価する。トップレベルとコマンド置換のブロックだけを受け付ける。
    ///
    /// キャンセル要求が立っているとき、ブロックが残っていればまだ巻き戻し中なので
    /// 評価を拒み、空なら要求を消費してから評価する。前後でジョブを回収する。
    pub fn eval(&mut self, src: &str, io: &IoChain, kind: BlockKind) -> i32 {
        if !matches!(kind, BlockKind::Top | BlockKind::Subst) {
            tracing::error!(
                "tried to evaluate commands using invalid block type '{}'",
                kind.description()
            );
            return 1;
        }

        if self.ctx.cancellation_requested() {
            if !self.blocks.is_empty() {
                return 1;
            }
            self.ctx.clear_cancellation();
        }

        if self.blocks.is_empty() {
            self.vars.universal().begin_command();
        }

        proc::job_reap(self, false);

        let depth = self.blocks.len();
        self.push_block(Block::new(kind));
        let evaluator = Arc::clone(&self.evaluator);
        let result = evaluator.eval(self, src, io);

        if self.blocks.len() <= depth {
            tracing::error!("end of block mismatch, program terminating");
            std::process::abort();
        }
        while self.blocks.len() > depth {
            self.pop_block();
        }

        proc::job_reap(self, false);
        result
    }

    /// 子パーサーをワーカースレッドで評価し、終わるまで待つ。
    ///
    /// 子は変数スタックの末尾とブロックスタックを引き継ぎ、ジョブリストは空から始まる。
    /// 完了は `eproc` で通知し、子の最終ステータスをこのパーサーの `$status` にする。
    pub fn eval_in_child(
        &mut self,
        src: &str,
        eproc: Arc<EmulatedProcess>,
        io: &IoChain,
        kind: BlockKind,
    ) -> i32 {
        let status = match self.spawn_child_eval(src, &eproc, io, kind).map(|h| h.join()) {
            Ok(Ok(status)) => status,
            Ok(Err(_)) => {
                tracing::error!("child evaluation panicked");
                1
            }
            Err(e) => {
                tracing::error!("failed to start evaluation thread: {}", e);
                1
            }
        };
        self.set_last_status(status);
        status
    }

    /// 子パーサーの評価を始めてすぐ戻る。
    ///
    /// 結果は `eproc` の完了フラグとステータスでだけ伝わり、このパーサーの `$status` は変えない。
    /// 評価スレッドを起動できなかったときも `eproc` はステータス 1 で完了する。
    pub fn eval_in_child_concurrent(
        &self,
        src: &str,
        eproc: Arc<EmulatedProcess>,
        io: &IoChain,
        kind: BlockKind,
    ) -> std::io::Result<()> {
        self.spawn_child_eval(src, &eproc, io, kind).map(drop)
    }

    fn spawn_child_eval(
        &self,
        src: &str,
        eproc: &Arc<EmulatedProcess>,
        io: &IoChain,
        kind: BlockKind,
    ) -> std::io::Result<JoinHandle<i32>> {
        let mut child = self.child_parser();
        let src = src.to_string();
        let io = io.clone();
        // スレッドが起動しなかった場合やパニックした場合にも完了させる
        let done = FinishOnDrop(Arc::clone(eproc));
        std::thread::Builder::new()
            .name("rush-eval".into())
            .spawn(move || {
                let done = done;
                child.eval(&src, &io, kind);
                let status = child.last_status();
                done.0.finish(status);
                status
            })
    }

    fn child_parser(&self) -> Parser {
        let blocks = self
            .blocks
            .iter()
            .cloned()
            .map(|mut b| {
                // 変数スコープは親が降ろす
                b.wants_pop_env = false;
                b
            })
            .collect();
        Parser {
            ctx: Arc::clone(&self.ctx),
            vars: self.vars.child(),
            jobs: JobList::new(),
            blocks,
            functions: Arc::clone(&self.functions),
            evaluator: Arc::clone(&self.evaluator),
            interactive_filenames: self.interactive_filenames.clone(),
            is_interactive_stack: self.is_interactive_stack.clone(),
            is_event: self.is_event,
            is_subshell: self.is_subshell,
            within_initialization: self.within_initialization,
            lineno: self.lineno,
            reaping: false,
            last_bg_pid: self.last_bg_pid,
        }
    }
}

/// 未完了のまま落ちたら失敗として完了させる。
struct FinishOnDrop(Arc<EmulatedProcess>);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        if !self.0.is_done() {
            self.0.finish(1);
        }
    }
}

impl Drop for Parser {
    fn drop(&mut self) {
        // 残ったジョブの未受領ステータスを手放す
        for job in self.jobs.iter() {
            self.ctx.job_store.forget_job(job);
        }
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("blocks", &self.blocks)
            .field("jobs", &self.jobs)
            .field("lineno", &self.lineno)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ShellConfig;
    use crate::env::EnvCollaborators;

    /// 何もしない評価器。`src` を整数として読めればそれを `$status` にする。
    pub struct StatusEvaluator;

    impl Evaluator for StatusEvaluator {
        fn eval(&self, parser: &mut Parser, src: &str, _io: &IoChain) -> i32 {
            let status = src.trim().parse().unwrap_or(0);
            parser.set_last_status(status);
            status
        }
    }

    pub fn parser_with(config: ShellConfig, evaluator: Arc<dyn Evaluator>) -> Parser {
        let ctx = ShellContext::with_store(config, crate::reaper::shared_test_store());
        Parser::new(ctx, EnvStack::new(EnvCollaborators::default()), evaluator)
    }

    pub fn test_parser() -> Parser {
        parser_with(ShellConfig::default(), Arc::new(StatusEvaluator))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::event::Event;

    #[test]
    fn skip_state_is_inherited_except_for_top_and_subst() {
        let mut parser = test_parser();
        parser.push_block(Block::new(BlockKind::If));
        parser.current_block_mut().unwrap().skip = true;
        parser.push_block(Block::new(BlockKind::While));
        assert!(parser.current_block().unwrap().skip);
        parser.push_block(Block::new(BlockKind::Subst));
        assert!(!parser.current_block().unwrap().skip);
        parser.push_block(Block::new(BlockKind::FunctionDef));
        assert!(parser.current_block().unwrap().skip);
        while parser.pop_block().is_some() {}
    }

    #[test]
    fn blocks_own_matching_env_scopes() {
        let mut parser = test_parser();
        let base = parser.vars().live_nodes();

        parser.push_block(Block::new(BlockKind::Top));
        assert!(!parser.current_block().unwrap().wants_pop_env());
        assert_eq!(parser.vars().live_nodes(), base);

        parser.push_block(Block::new(BlockKind::function_call("f", vec![], true)));
        parser.vars.set("x", Some("1"), EnvMode::LOCAL).unwrap();
        assert_eq!(parser.vars().live_nodes(), base + 1);

        parser.pop_block();
        assert_eq!(parser.vars().get("x", EnvMode::DEFAULT), None);
        assert_eq!(parser.vars().live_nodes(), base);
        parser.pop_block();
        assert!(parser.pop_block().is_none());
    }

    #[test]
    fn function_call_hides_caller_locals() {
        let mut parser = test_parser();
        parser.push_block(Block::new(BlockKind::Begin));
        parser.vars.set("outer", Some("1"), EnvMode::LOCAL).unwrap();
        parser.push_block(Block::new(BlockKind::function_call("g", vec![], false)));
        assert_eq!(parser.vars().get("outer", EnvMode::DEFAULT).as_deref(), Some("1"));
        parser.push_block(Block::new(BlockKind::function_call("f", vec![], true)));
        assert_eq!(parser.vars().get("outer", EnvMode::DEFAULT), None);
        while parser.pop_block().is_some() {}
    }

    #[test]
    fn description_indents_each_level() {
        let mut parser = test_parser();
        parser.push_block(Block::new(BlockKind::Top));
        parser.push_block(Block::new(BlockKind::For));
        parser.push_block(Block::new(BlockKind::If));
        assert_eq!(
            parser.block_stack_description(),
            "global root block\n 'for' block\n  'if' conditional block"
        );
        assert!(parser.block_is_on_stack());
        while parser.pop_block().is_some() {}
        parser.push_block(Block::new(BlockKind::Top));
        parser.push_block(Block::new(BlockKind::Subst));
        assert!(!parser.block_is_on_stack());
        while parser.pop_block().is_some() {}
    }

    #[test]
    fn filename_and_lineno_follow_function_definition() {
        let functions = Arc::new(FunctionTable::new());
        functions.define("greet", Some("/etc/rush/greet.rush"), 10);
        let mut parser = test_parser().with_functions(functions);
        parser.push_interactive_filename("script.rush");
        assert_eq!(parser.current_filename().as_deref(), Some("script.rush"));
        assert_eq!(parser.get_lineno(), -1);

        parser.set_lineno(Some(3));
        assert_eq!(parser.get_lineno(), 3);
        parser.push_block(Block::new(BlockKind::function_call("greet", vec![], true)));
        assert_eq!(parser.is_function().as_deref(), Some("greet"));
        assert_eq!(parser.get_lineno(), 13);
        assert_eq!(parser.current_filename().as_deref(), Some("/etc/rush/greet.rush"));

        // 読み込んだファイルの中では外側の関数は関係ない
        parser.push_block(Block::new(BlockKind::Source { file: "lib.rush".into() }));
        assert_eq!(parser.is_function(), None);
        assert_eq!(parser.current_filename().as_deref(), Some("lib.rush"));
        while parser.pop_block().is_some() {}
    }

    #[test]
    fn stack_trace_renders_frames_and_stops_at_event_handler() {
        let mut parser = test_parser();
        parser.set_lineno(Some(5));
        parser.push_block(Block::new(BlockKind::Top));
        parser.push_block(Block::new(BlockKind::Event { event: Event::variable("SET", "PATH") }));
        parser.push_block(Block::new(BlockKind::Source { file: "/tmp/conf.rush".into() }));
        parser.push_block(Block::new(BlockKind::function_call(
            "f",
            vec!["a".into(), "b".into()],
            true,
        )));
        parser.push_block(Block::new(BlockKind::While));

        let trace = parser.backtrace();
        assert_eq!(
            trace,
            "in function 'f'\n\
             \tcalled on line 5 of file /tmp/conf.rush\n\
             \twith parameter list 'a b'\n\
             \n\
             from sourcing file /tmp/conf.rush\n\
             \tcalled on standard input\n\
             \n\
             in event handler: handler for variable 'PATH'\n\
             \n"
        );
        while parser.pop_block().is_some() {}
    }

    #[test]
    fn startup_frames_say_so() {
        let mut parser = test_parser();
        parser.set_is_within_initialization(true);
        parser.push_block(Block::new(BlockKind::Subst));
        assert_eq!(
            parser.backtrace(),
            "in command substitution\n\tcalled during startup\n\n"
        );
        parser.pop_block();
    }

    #[test]
    fn presentable_path_collapses_home() {
        let parser = test_parser();
        parser.vars.set("HOME", Some("/home/ann"), EnvMode::GLOBAL).unwrap();
        assert_eq!(parser.user_presentable_path("/home/ann/x.rush"), "~/x.rush");
        assert_eq!(parser.user_presentable_path("/home/anna/x"), "/home/anna/x");
        assert_eq!(parser.user_presentable_path("/etc/x"), "/etc/x");
    }

    #[test]
    fn eval_rejects_non_top_blocks_and_restores_stack() {
        let mut parser = test_parser();
        assert_eq!(parser.eval("0", &IoChain::new(), BlockKind::While), 1);
        assert_eq!(parser.eval("4", &IoChain::new(), BlockKind::Top), 4);
        assert_eq!(parser.last_status(), 4);
        assert_eq!(parser.block_count(), 0);
    }

    #[test]
    fn cancellation_is_consumed_on_empty_stack() {
        let mut parser = test_parser();
        parser.push_block(Block::new(BlockKind::Top));
        parser.skip_all_blocks();
        assert!(parser.current_block().unwrap().skip);
        // 巻き戻し中は評価しない
        assert_eq!(parser.eval("0", &IoChain::new(), BlockKind::Subst), 1);
        parser.pop_block();
        assert_eq!(parser.eval("0", &IoChain::new(), BlockKind::Top), 0);
        assert!(!parser.ctx().cancellation_requested());
    }

    #[test]
    fn child_evaluation_reports_through_emulated_process() {
        let mut parser = test_parser();
        parser.push_block(Block::new(BlockKind::Begin));
        let eproc = Arc::new(EmulatedProcess::new());
        let status = parser.eval_in_child("9", Arc::clone(&eproc), &IoChain::new(), BlockKind::Top);
        assert_eq!(status, 9);
        assert!(eproc.is_done());
        assert_eq!(eproc.status(), 9);
        assert_eq!(parser.last_status(), 9);
        // 親のブロックとスコープはそのまま
        assert_eq!(parser.block_count(), 1);
        parser.pop_block();
    }

    #[test]
    fn concurrent_child_evaluation_returns_before_completion() {
        let mut parser = test_parser();
        parser.set_last_status(3);
        let eproc = Arc::new(EmulatedProcess::new());
        parser
            .eval_in_child_concurrent("12", Arc::clone(&eproc), &IoChain::new(), BlockKind::Top)
            .unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !eproc.is_done() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(eproc.is_done());
        assert_eq!(eproc.status(), 12);
        // 親の $status はそのまま
        assert_eq!(parser.last_status(), 3);
    }

    #[test]
    fn removed_job_does_not_leave_status_for_reused_pid() {
        let mut parser = test_parser();
        let store = Arc::clone(&parser.ctx().job_store);
        let ids = Arc::clone(&parser.ctx().job_ids);
        let pid = crate::reaper::test_support::spawn_sh("exit 3");
        let job = crate::reaper::test_support::job_for(&ids, &[pid]);
        let id = job.id();
        parser.job_add(job);

        // 回収されるのを待つが、ステータスは受け取らない
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while !store.has_status(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(store.has_status(pid));
        parser.job_remove(id);
        assert!(!store.has_status(pid));

        // 同じ pid 番号を持つ新しいジョブには古いステータスが渡らない
        let mut jobs = JobList::new();
        jobs.add(crate::reaper::test_support::job_for(&ids, &[pid]));
        assert_eq!(store.wait_for_job(&jobs, crate::reaper::WaitTimeout::Poll), None);
    }

    #[test]
    fn job_lookup_wrappers() {
        let mut parser = test_parser();
        let ids = Arc::clone(&parser.ctx().job_ids);
        let mut a = Job::new("a", &ids, IoChain::new());
        a.pgid = 4001;
        let b = Job::new("b", &ids, IoChain::new());
        let (ida, idb) = (a.id(), b.id());
        parser.job_add(a);
        parser.job_add(b);
        assert_eq!(parser.job_get(0).map(Job::id), Some(idb));
        parser.job_promote(ida);
        assert_eq!(parser.job_get(0).map(Job::id), Some(ida));
        assert_eq!(parser.job_get_from_pid(4001).map(Job::id), Some(ida));
        assert!(parser.job_remove(ida).is_some());
        assert!(parser.job_remove(ida).is_none());
    }
}
