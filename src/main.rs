//! rush-core: ジョブ制御と変数スコープのコアを動かす小さなドライバ。
//!
//! - `rush-core -c 'cmd'`: 1 行を評価して終了
//! - `rush-core FILE`: ファイルを 1 行ずつ評価
//! - 引数なし: 標準入力から 1 行ずつ読む。端末なら対話セッションとしてプロンプトを出す
//!
//! 評価は [`PipelineEvaluator`]（外部コマンドのパイプラインのみ）で行う。

use std::io::{BufRead, Write};
use std::sync::Arc;

use rush_core::block::BlockKind;
use rush_core::config::ShellConfig;
use rush_core::context::ShellContext;
use rush_core::env::{EnvCollaborators, EnvStack};
use rush_core::executor::PipelineEvaluator;
use rush_core::io::IoChain;
use rush_core::parser::Parser;
use rush_core::{logging, proc};

/// 対話シェルのシグナルと端末の準備。
///
/// シェル自体は SIGINT/SIGQUIT/SIGTSTP/SIGTTOU/SIGTTIN を無視する。
/// 子プロセスは posix_spawnattr の POSIX_SPAWN_SETSIGDEF で SIG_DFL に戻る。
fn setup_interactive_terminal() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGQUIT, libc::SIG_IGN);
        libc::signal(libc::SIGTSTP, libc::SIG_IGN);
        libc::signal(libc::SIGTTOU, libc::SIG_IGN);
        libc::signal(libc::SIGTTIN, libc::SIG_IGN);

        let shell_pid = libc::getpid();
        if libc::setpgid(shell_pid, shell_pid) != 0 {
            tracing::debug!("setpgid failed: {}", std::io::Error::last_os_error());
        }
        if libc::tcsetpgrp(libc::STDIN_FILENO, shell_pid) != 0 {
            tracing::warn!("could not take the terminal: {}", std::io::Error::last_os_error());
        }
    }
}

fn build_parser(config: ShellConfig) -> Parser {
    let import = config.import_environment;
    let ctx = ShellContext::new(config);
    let mut vars = EnvStack::new(EnvCollaborators::default());
    let environ: Vec<(String, String)> = if import { std::env::vars().collect() } else { Vec::new() };
    vars.init(environ);
    Parser::new(ctx, vars, Arc::new(PipelineEvaluator))
}

fn run_lines(parser: &mut Parser, input: impl BufRead, interactive: bool) {
    let io = IoChain::new();
    let mut lines = input.lines();
    loop {
        if interactive {
            // プロンプト前にバックグラウンドジョブを回収し、完了通知を出す
            proc::job_reap(parser, true);
            let status = parser.last_status();
            if status == 0 {
                print!("rush$ ");
            } else {
                print!("[{}] rush$ ", status);
            }
            let _ = std::io::stdout().flush();
        }
        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                eprintln!("rush: read error: {}", e);
                break;
            }
            None => {
                if interactive {
                    println!();
                }
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if interactive {
            parser.vars().add_history(&line);
        }
        parser.eval(&line, &io, BlockKind::Top);
    }
}

fn main() {
    logging::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let stdin_is_tty = unsafe { libc::isatty(libc::STDIN_FILENO) } == 1;
    let interactive = args.is_empty() && stdin_is_tty;

    let config = ShellConfig {
        interactive_session: interactive,
        program_name: "rush".to_string(),
        ..ShellConfig::default()
    }
    .with_env_overrides();
    if interactive {
        setup_interactive_terminal();
    }

    let mut parser = build_parser(config);
    parser.push_is_interactive(interactive);

    match args.first().map(String::as_str) {
        Some("-c") => match args.get(1) {
            Some(cmd) => {
                parser.eval(cmd, &IoChain::new(), BlockKind::Top);
            }
            None => {
                eprintln!("rush: -c: option requires an argument");
                std::process::exit(2);
            }
        },
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => {
                parser.push_interactive_filename(path);
                run_lines(&mut parser, std::io::BufReader::new(file), false);
            }
            Err(e) => {
                eprintln!("rush: {}: {}", path, e);
                std::process::exit(127);
            }
        },
        None => run_lines(&mut parser, std::io::stdin().lock(), interactive),
    }

    std::process::exit(parser.last_status());
}
