//! Reflow CLI - terminal watcher for live agent runs.

mod commands;

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use commands::{Commands, build_transport, handle_command};
use reflow_core::{
    AgentRunConsumer, BillingAlert, Config, RunObserver, RunSnapshot, ToolOutputEvent,
};

/// Reflow CLI - attach to a live agent run and render its reconstruction
#[derive(Parser)]
#[command(name = "reflow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The agent run to watch
    run_id: Option<String>,

    /// Override the API base URL from config
    #[arg(short, long)]
    base_url: Option<String>,

    /// Thread/conversation context to bind the consumer to
    #[arg(short, long, default_value = "default")]
    thread: String,

    /// Also print live tool output chunks as they arrive
    #[arg(long)]
    tool_output: bool,

    /// Run management commands
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Observer that renders side-channel notifications to stderr.
struct ConsoleObserver {
    tool_output: bool,
}

impl RunObserver for ConsoleObserver {
    fn on_billing_alert(&self, alert: &BillingAlert) {
        eprintln!("\n[billing] {}: {}", alert.alert_title, alert.alert_subtitle);
    }

    fn on_tool_output(&self, output: &ToolOutputEvent) {
        if self.tool_output {
            eprint!("[{}] {}", output.tool_name, output.output);
        }
    }

    fn on_warning(&self, message: &str) {
        eprintln!("\n[warning] {message}");
    }

    fn on_error(&self, message: &str) {
        eprintln!("\n[error] {message}");
    }

    fn on_stop_failure(&self, message: &str) {
        eprintln!("\n[warning] stop request failed: {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::load().unwrap_or_default();

    // Apply base URL override from CLI flag
    if let Some(ref base_url) = args.base_url {
        config.base_url = base_url.clone();
    }

    // Handle subcommands
    if let Some(command) = args.command {
        return handle_command(command, &config).await;
    }

    let Some(run_id) = args.run_id else {
        eprintln!("No run id given. Try `reflow <run-id>` or `reflow --help`.");
        std::process::exit(1);
    };

    watch_run(&config, &run_id, &args.thread, args.tool_output).await
}

/// Attach to the run and render snapshots until it reaches a terminal state.
async fn watch_run(config: &Config, run_id: &str, thread: &str, tool_output: bool) -> Result<()> {
    tracing::debug!(run_id, base_url = %config.base_url, "watching agent run");
    let transport = Arc::new(build_transport(config));
    let observer = Arc::new(ConsoleObserver { tool_output });

    let mut consumer = AgentRunConsumer::new(transport, config.stream.clone())
        .with_observer(observer)
        .for_thread(thread);

    consumer
        .start_streaming(run_id)
        .await
        .context("Failed to start streaming")?;

    let mut updates = consumer.subscribe();
    let mut renderer = Renderer::new();

    // The run may have settled terminally without ever opening a stream.
    let snapshot = updates.borrow_and_update().clone();
    renderer.render(&snapshot)?;
    if snapshot.status.is_terminal() {
        eprintln!("\n[{}]", snapshot.status);
        return Ok(());
    }

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                renderer.render(&snapshot)?;
                if snapshot.status.is_terminal() {
                    eprintln!("\n[{}]", snapshot.status);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n[stopping]");
                consumer.stop_streaming().await;
            }
        }
    }

    Ok(())
}

/// Incremental renderer: prints only what each snapshot adds.
struct Renderer {
    rendered_text: String,
    announced: HashSet<String>,
    completed: HashSet<String>,
}

impl Renderer {
    fn new() -> Self {
        Self {
            rendered_text: String::new(),
            announced: HashSet::new(),
            completed: HashSet::new(),
        }
    }

    fn render(&mut self, snapshot: &RunSnapshot) -> Result<()> {
        if snapshot.text_content != self.rendered_text {
            let mut stdout = io::stdout();
            if let Some(suffix) = snapshot.text_content.strip_prefix(&self.rendered_text) {
                write!(stdout, "{suffix}").context("Failed to write output")?;
            } else {
                // A late out-of-order fragment changed earlier text; reprint.
                writeln!(stdout).context("Failed to write output")?;
                write!(stdout, "{}", snapshot.text_content).context("Failed to write output")?;
            }
            stdout.flush().context("Failed to flush stdout")?;
            self.rendered_text = snapshot.text_content.clone();
        }

        for call in &snapshot.tool_calls {
            if self.announced.insert(call.tool_call_id.clone()) {
                eprintln!("\n[tool] {} ...", call.function_name);
            }
            if call.completed && self.completed.insert(call.tool_call_id.clone()) {
                let outcome = match call.tool_result {
                    Some(ref result) if result.success => "ok",
                    Some(_) => "failed",
                    None => "done",
                };
                eprintln!("[tool] {} {}", call.function_name, outcome);
            }
        }

        Ok(())
    }
}
