//! Courier - 自主浏览器任务编排器
//!
//! 入口：初始化日志、加载配置、选择环境网关、启动编排器，并在终端读取控制命令。
//! 普通输入即新任务目标；以 `/` 开头的是控制命令（/help 查看）。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use courier::config::{load_config, AppConfig};
use courier::core::{create_orchestrator, Command, TaskSnapshot};
use courier::env::EnvironmentGateway;
use courier::observability;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot};

const HELP: &str = "\
  <goal>            start a new task
  /stop             stop the current task
  /reset            discard the current task silently
  /takeover         take manual control in the browser
  /auto             hand control back to the agent
  /teach <goal>     demonstrate a task in the browser
  /endteach         finish the demonstration
  /attempt          execute the plan agreed in a debate
  /unlock <pass>    unlock the credential vault
  /save <name>      save the pending credential under a name
  /task             show the current task
  /history          list archived tasks
  /delete <ts>      delete a history entry by timestamp
  /quit             exit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "config load failed, using defaults");
            AppConfig::default()
        }
    };

    let gateway = build_gateway(&cfg);
    let (cmd_tx, _state_rx, notify_rx) = create_orchestrator(&cfg, gateway)
        .await
        .context("Failed to create orchestrator")?;

    tokio::spawn(print_updates(notify_rx));

    println!("🚚 Courier ready. Type a goal, or /help.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_command(line) {
            Input::Help => println!("{HELP}"),
            Input::Invalid(msg) => println!("⚠️ {msg}"),
            Input::ShowTask => show_task(&cmd_tx).await,
            Input::ShowHistory => show_history(&cmd_tx).await,
            Input::Send(cmd) => {
                let quit = matches!(cmd, Command::Quit);
                if cmd_tx.send(cmd).is_err() || quit {
                    break;
                }
            }
        }
    }
    let _ = cmd_tx.send(Command::Quit);
    Ok(())
}

#[cfg(feature = "browser")]
fn build_gateway(cfg: &AppConfig) -> Arc<dyn EnvironmentGateway> {
    let index = courier::core::orchestrator::semantic_index_from_config(cfg);
    Arc::new(courier::env::ChromeGateway::new(index))
}

#[cfg(not(feature = "browser"))]
fn build_gateway(_cfg: &AppConfig) -> Arc<dyn EnvironmentGateway> {
    tracing::warn!("built without the browser feature, using the offline mock gateway");
    Arc::new(courier::env::MockGateway::new())
}

enum Input {
    Help,
    Invalid(String),
    ShowTask,
    ShowHistory,
    Send(Command),
}

fn parse_command(line: &str) -> Input {
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Send(Command::StartTask {
            goal: line.to_string(),
        });
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let cmd = match name {
        "help" => return Input::Help,
        "task" => return Input::ShowTask,
        "history" => return Input::ShowHistory,
        "stop" => Command::StopTask,
        "reset" => Command::ResetTaskSession,
        "takeover" => Command::TakeOver,
        "auto" => Command::GoAutonomous,
        "endteach" => Command::StopTeaching,
        "attempt" => Command::AttemptStrategy { plan: Vec::new() },
        "quit" | "exit" => Command::Quit,
        "teach" if !arg.is_empty() => Command::StartTeaching {
            goal: arg.to_string(),
        },
        "unlock" if !arg.is_empty() => Command::UnlockVault {
            passphrase: arg.to_string(),
        },
        "save" if !arg.is_empty() => Command::SaveCredential {
            name: arg.to_string(),
        },
        "delete" => match arg.parse::<i64>() {
            Ok(timestamp) => Command::DeleteHistoricalTask { timestamp },
            Err(_) => return Input::Invalid("usage: /delete <timestamp>".into()),
        },
        "teach" | "unlock" | "save" => {
            return Input::Invalid(format!("/{name} needs an argument"))
        }
        other => return Input::Invalid(format!("unknown command /{other}")),
    };
    Input::Send(cmd)
}

async fn print_updates(mut rx: broadcast::Receiver<TaskSnapshot>) {
    let mut last_log = 0usize;
    let mut last_id = String::new();
    loop {
        let snapshot = match rx.recv().await {
            Ok(s) => s,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "status printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if snapshot.id != last_id {
            last_id = snapshot.id.clone();
            last_log = 0;
        }
        for entry in snapshot.scratchpad.iter().skip(last_log) {
            println!("  · {entry}");
        }
        last_log = snapshot.scratchpad.len();
        println!("[{}] turn {}", snapshot.status, snapshot.turn);
        if let Some(answer) = &snapshot.final_answer {
            if snapshot.status.is_terminal() {
                println!("✅ {answer}");
            }
        }
        if let Some(cta) = &snapshot.call_to_action {
            println!("👉 {cta}");
        } else if snapshot.status.awaits_user() {
            println!("⏸ Waiting for you ({}). /help lists the commands.", snapshot.status);
        }
        if let Some(reason) = &snapshot.failure_reason {
            println!("❌ {reason}");
        }
    }
}

async fn show_task(cmd_tx: &mpsc::UnboundedSender<Command>) {
    let (tx, rx) = oneshot::channel();
    if cmd_tx.send(Command::GetTask(tx)).is_err() {
        return;
    }
    match rx.await {
        Ok(Some(snapshot)) => match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{json}"),
            Err(e) => println!("⚠️ {e}"),
        },
        Ok(None) => println!("No active task."),
        Err(_) => println!("⚠️ orchestrator is gone"),
    }
}

async fn show_history(cmd_tx: &mpsc::UnboundedSender<Command>) {
    let (tx, rx) = oneshot::channel();
    if cmd_tx.send(Command::GetHistory(tx)).is_err() {
        return;
    }
    match rx.await {
        Ok(entries) if entries.is_empty() => println!("No history yet."),
        Ok(entries) => {
            for e in entries {
                println!("{}  [{}] {}", e.timestamp, e.status, e.goal);
            }
        }
        Err(_) => println!("⚠️ orchestrator is gone"),
    }
}
