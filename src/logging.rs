//! 診断ログの初期化。
//!
//! ジョブ通知（`'cmd' has ended` など）はシェルの UI として stdout に出す。
//! ここで扱うのは内部診断（追跡不整合、回収スレッド、端末受け渡しの失敗など）だけ。
//!
//! # 環境変数
//!
//! - `RUSH_LOG`: ログフィルタ（`RUST_LOG` より優先）
//! - `RUST_LOG`: 標準のフィルタ（フォールバック）

use tracing_subscriber::EnvFilter;

/// フィルタ指定がないときのレベル。
pub const DEFAULT_FILTER: &str = "warn";

/// 使用するフィルタ文字列を決める。
fn filter_directive(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("RUSH_LOG")
        .or_else(|| lookup("RUST_LOG"))
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

/// グローバル subscriber を設定する。2 回目以降の呼び出しは無視される。
pub fn init() {
    let directive = filter_directive(|k| std::env::var(k).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .try_init();
}
