//! rush-core: シェルのジョブ制御と変数スコープのコア。
//!
//! バイナリ本体は `main.rs` の小さなドライバ。
//! この `lib.rs` はドライバ・`benches/bench_main.rs`・スクリプト評価器の実装から
//! 各サブシステムに直接アクセスするために存在する。
//!
//! ## モジュール構成
//!
//! | モジュール | 役割 |
//! |-----------|------|
//! | [`job_id`] | ジョブ ID の割り当て（最小の空き番号、解放後の再利用） |
//! | [`reaper`] | ジョブストア（回収スレッド / `SIGCHLD` 方式、pid→ステータス表、待機と中断） |
//! | [`job`] | プロセス・ジョブのレコードとジョブリスト、ジョブへのシグナル送信 |
//! | [`proc`] | ステータスの反映（`SIGPIPE` 伝播）、回収と通知、ジョブ再開と端末の受け渡し |
//! | [`env`] | 変数スコープのスタック（ローカル/グローバル/ユニバーサル、electric 変数、特殊変数の副作用） |
//! | [`export`] | 子プロセス用エクスポート配列の遅延再構築 |
//! | [`universal`] | ユニバーサル変数ストアの契約とメモリ実装、同期バリア |
//! | [`event`] | 変数変更・プロセス終了・ジョブ終了イベント |
//! | [`io`] | リダイレクトチェーンと出力バッファ |
//! | [`block`] | 実行ブロックの種類と状態 |
//! | [`parser`] | 評価コンテキスト（ブロックスタック、行番号・ファイル名、バックトレース、評価） |
//! | [`spawn`] | `posix_spawnp` ラッパー |
//! | [`executor`] | パイプラインの起動と行単位の簡易評価器 |
//! | [`context`] | プロセス全体で共有する状態（ジョブストア、ID アロケータ、キャンセル要求） |
//! | [`config`] | 設定（回収方式、ジョブ制御モード） |
//! | [`logging`] | `tracing` の初期化 |
//! | [`error`] | エラー型 |

pub mod block;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod event;
pub mod executor;
pub mod export;
pub mod io;
pub mod job;
pub mod job_id;
pub mod logging;
pub mod parser;
pub mod proc;
pub mod reaper;
pub mod spawn;
pub mod universal;
