#![forbid(unsafe_code)]

//! `assistant-relay-ctl`: command-line client for a running `assistant-relay`.
//!
//! Sends chat requests and renders the NDJSON stream the way the UI does:
//! progress units go to stderr, the final answer to stdout.

use std::path::PathBuf;

use bytes::BytesMut;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use assistant_relay::stream::codec::LineFramer;
use assistant_relay::stream::event::{classify, EventKind};

type CtlResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(
    name = "assistant-relay-ctl",
    about = "Command-line client for assistant-relay",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the relay.
    #[arg(long, default_value = "http://127.0.0.1:3002")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the relay is up.
    Health,

    /// Send a prompt and stream the answer.
    Chat {
        /// Prompt text.
        message: String,
        /// Working directory for the assistant.
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Identifier usable with `cancel`.
        #[arg(long)]
        request_id: Option<String>,
        /// Persist the exchange into this chat.
        #[arg(long)]
        chat_id: Option<String>,
        /// Continue the previous conversation.
        #[arg(long = "continue")]
        continue_chat: bool,
        /// Request plain-text progress instead of structured events.
        #[arg(long = "static")]
        static_mode: bool,
        /// Print every raw record as it arrives.
        #[arg(long)]
        verbose: bool,
    },

    /// Cancel an in-flight request.
    Cancel {
        /// Request identifier.
        request_id: String,
    },

    /// Report whether a directory has assistant configuration.
    Check {
        /// Project directory.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Run the assistant's project initialization.
    Init {
        /// Project directory.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// List stored chats.
    Chats,

    /// Create a chat.
    NewChat {
        /// Optional title.
        #[arg(long)]
        title: Option<String>,
        /// Bound project directory.
        #[arg(long)]
        project: Option<PathBuf>,
    },

    /// Show a chat with its messages.
    Show {
        /// Chat identifier.
        id: String,
    },

    /// Delete a chat.
    Delete {
        /// Chat identifier.
        id: String,
    },
}

fn main() {
    let args = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

/// Execute one command. Returns `false` when the relay reported a failure.
async fn run(args: Cli) -> CtlResult<bool> {
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/').to_owned();

    match args.command {
        Command::Health => print_json(client.get(format!("{base}/health")).send().await?).await,
        Command::Chat {
            message,
            dir,
            request_id,
            chat_id,
            continue_chat,
            static_mode,
            verbose,
        } => {
            let mut body = json!({
                "message": message,
                "workingDirectory": absolute(&dir),
                "mode": if static_mode { "static" } else { "streaming" },
            });
            if continue_chat {
                body["isExistingChat"] = Value::Bool(true);
            }
            if let Some(id) = request_id {
                body["requestId"] = Value::String(id);
            }
            if let Some(id) = chat_id {
                body["chatId"] = Value::String(id);
            }
            stream_chat(&client, &base, &body, verbose).await
        }
        Command::Cancel { request_id } => {
            let resp = client
                .post(format!("{base}/api/chat/cancel"))
                .json(&json!({ "requestId": request_id }))
                .send()
                .await?;
            print_json(resp).await
        }
        Command::Check { dir } => {
            let resp = client
                .post(format!("{base}/api/project/check"))
                .json(&json!({ "workingDirectory": absolute(&dir) }))
                .send()
                .await?;
            print_json(resp).await
        }
        Command::Init { dir } => {
            let resp = client
                .post(format!("{base}/api/project/init"))
                .json(&json!({ "workingDirectory": absolute(&dir) }))
                .send()
                .await?;
            print_json(resp).await
        }
        Command::Chats => print_json(client.get(format!("{base}/api/chats")).send().await?).await,
        Command::NewChat { title, project } => {
            let mut body = json!({});
            if let Some(title) = title {
                body["title"] = Value::String(title);
            }
            if let Some(project) = project {
                let path = absolute(&project);
                body["projectName"] = project
                    .file_name()
                    .map_or(Value::Null, |n| Value::String(n.to_string_lossy().into_owned()));
                body["projectPath"] = Value::String(path);
            }
            let resp = client
                .post(format!("{base}/api/chats"))
                .json(&body)
                .send()
                .await?;
            print_json(resp).await
        }
        Command::Show { id } => {
            print_json(client.get(format!("{base}/api/chats/{id}")).send().await?).await
        }
        Command::Delete { id } => {
            print_json(client.delete(format!("{base}/api/chats/{id}")).send().await?).await
        }
    }
}

async fn stream_chat(
    client: &reqwest::Client,
    base: &str,
    body: &Value,
    verbose: bool,
) -> CtlResult<bool> {
    let mut resp = client
        .post(format!("{base}/api/chat"))
        .json(body)
        .send()
        .await?;
    if !resp.status().is_success() {
        return print_json(resp).await;
    }

    let mut framer = LineFramer::new();
    let mut buf = BytesMut::new();
    let mut ok = true;
    while let Some(chunk) = resp.chunk().await? {
        for line in framer.push_chunk(&mut buf, &chunk) {
            ok &= render_line(&line, verbose);
        }
    }
    framer.finish(&mut buf);
    Ok(ok)
}

/// Print one stream line. Returns `false` for a terminal error line.
fn render_line(line: &str, verbose: bool) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    if verbose {
        eprintln!("{line}");
    }

    let event = classify(line);
    if event.raw.get("type").and_then(Value::as_str) == Some("progress") {
        if let Some(content) = event.raw.get("content").and_then(Value::as_str) {
            eprint!("{content}");
        }
        return true;
    }

    let unit = event.content_unit();
    match event.kind {
        EventKind::FinalResult => {
            println!("{}", unit.text);
            true
        }
        EventKind::Error => {
            eprintln!("{}", unit.text);
            false
        }
        _ => {
            if unit.is_displayable() && !verbose {
                eprintln!("{}", unit.text);
            }
            true
        }
    }
}

async fn print_json(resp: reqwest::Response) -> CtlResult<bool> {
    let ok = resp.status().is_success();
    let body: Value = resp.json().await?;
    let pretty = serde_json::to_string_pretty(&body)?;
    if ok {
        println!("{pretty}");
    } else {
        eprintln!("{pretty}");
    }
    Ok(ok)
}

fn absolute(dir: &std::path::Path) -> String {
    std::fs::canonicalize(dir)
        .unwrap_or_else(|_| dir.to_path_buf())
        .to_string_lossy()
        .into_owned()
}
