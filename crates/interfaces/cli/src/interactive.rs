use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};

use promptlab_config::{AppConfig, GenerationConfig};
use promptlab_llm::InferenceClient;
use promptlab_runtime::{ChatSession, HttpConversationStore, SessionSettings, Turn, TurnRole};
use promptlab_tools::ToolsClient;

pub(crate) async fn run_chat_session(config: &AppConfig, agent_mode: bool) -> Result<()> {
    let base_url = &config.backend.base_url;
    let llm = Arc::new(InferenceClient::new(base_url));
    let tools = Arc::new(ToolsClient::new(base_url));
    let store = Arc::new(HttpConversationStore::new(base_url));

    // Bootstrap cycle: a config carrying the reset flag takes the defaults
    // instead of stale knobs.
    let mut generation = config.generation.clone();
    if generation.needs_reset {
        generation = GenerationConfig::default();
    }

    let settings = SessionSettings {
        experiment_id: config.experiment.id.clone(),
        model: config.experiment.model.clone(),
        adaptor: config.experiment.adaptor_opt().map(ToString::to_string),
        system_message: config.experiment.system_message.clone(),
        generation,
    };

    let transport = Arc::clone(&llm);
    let mut session = ChatSession::new(llm, tools, store, settings);

    let mode = if agent_mode { "agent" } else { "chat" };
    println!(
        "{}{} — {mode} mode. /help for commands.",
        config.experiment.model,
        config
            .experiment
            .adaptor_opt()
            .map(|adaptor| format!(" + {adaptor}"))
            .unwrap_or_default()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/exit" | "/quit" => break,
            "/help" => {
                println!("Commands: /help, /id, /tokens, /stop, /exit");
                continue;
            }
            "/id" => {
                println!("{}", session.conversation().id().unwrap_or("(unsaved)"));
                continue;
            }
            "/tokens" => {
                let messages = session.conversation().to_backend_messages();
                match transport
                    .count_chat_tokens(&config.experiment.model, &messages)
                    .await
                {
                    Ok(count) => println!("{} tokens in history", count.token_count),
                    Err(err) => eprintln!("error: {err:#}"),
                }
                continue;
            }
            "/stop" => {
                transport.stop_generation().await;
                continue;
            }
            _ => {}
        }

        let seen = session.conversation().len();
        eprint!("thinking…");
        let result = if agent_mode {
            session.send_agent_message(line, None).await
        } else {
            session.send_message(line, None).await
        };
        eprint!("\r         \r");

        match result {
            Ok(_) => print_round(&session.conversation().turns()[seen..]),
            // No retry here; the user resubmits manually.
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    session.flush().await;
    Ok(())
}

/// Print every turn this round appended after the user's own input, so agent
/// rounds show the intermediate tool traffic.
fn print_round(turns: &[Turn]) {
    for turn in turns {
        match turn.role {
            TurnRole::Human => {}
            TurnRole::Tool => println!("[tool] {}", turn.text),
            TurnRole::Assistant => {
                println!("{}", turn.text);
                println!("  {}", metrics_line(turn));
            }
        }
    }
}

fn metrics_line(turn: &Turn) -> String {
    let tokens = turn
        .token_count
        .map(|count| count.to_string())
        .unwrap_or_else(|| "?".to_string());
    let first = turn
        .time_to_first_token
        .map(|ms| format!("{ms:.0} ms"))
        .unwrap_or_else(|| "n/a".to_string());
    let throughput = turn
        .tokens_per_second
        .map(|tps| format!("{tps:.1} tok/s"))
        .unwrap_or_else(|| "n/a".to_string());
    format!("[{tokens} tok · first token {first} · {throughput}]")
}
