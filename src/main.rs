//! Hive - 运维自动化运行时
//!
//! 入口：解析命令行、初始化日志、装配运行时。`serve` 在 stdio 上提供工具协议并运行调度器。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};

use hive::config::load_config;
use hive::core::shutdown::{ShutdownCoordinator, ShutdownReason};
use hive::server::ToolServer;
use hive::{observability, Runtime};

#[derive(Debug, Parser)]
#[command(name = "hive", version, about = "Operator automation runtime")]
struct Cli {
    /// 配置文件（叠加在 config/default.toml 之上）
    #[arg(long, global = true, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// 以 JSON 行输出日志
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the tool protocol on stdio and run scheduled jobs
    Serve(ServeArgs),
    /// Run a skill once and print the run record
    Run(RunArgs),
    /// List tools (optionally after switching persona)
    Tools(ToolsArgs),
    /// List personas
    Personas,
    /// List scheduled jobs and their last run
    Jobs,
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// 启动人格，覆盖 [app].default_persona
    #[arg(long)]
    persona: Option<String>,
    /// 不启动调度器
    #[arg(long)]
    no_scheduler: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    skill: String,
    /// 技能输入 key=value；value 能解析为 JSON 时按 JSON 处理
    #[arg(long = "input", short = 'i', value_name = "KEY=VALUE")]
    inputs: Vec<String>,
    #[arg(long)]
    persona: Option<String>,
}

#[derive(Debug, Args)]
struct ToolsArgs {
    #[arg(long)]
    persona: Option<String>,
}

fn parse_inputs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("input '{}' must be KEY=VALUE", pair);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(inputs)
}

async fn activate(runtime: &Runtime, persona: Option<&str>) -> anyhow::Result<()> {
    match persona {
        Some(name) => {
            runtime
                .personas()
                .switch(name)
                .await
                .with_context(|| format!("failed to activate persona '{}'", name))?;
        }
        None => {
            runtime
                .activate_default_persona()
                .await
                .context("failed to activate default persona")?;
        }
    }
    Ok(())
}

impl Cli {
    async fn run(self) -> anyhow::Result<()> {
        let config = load_config(self.config.as_deref()).context("failed to load config")?;
        let runtime = Runtime::from_config(config)
            .await
            .context("failed to assemble runtime")?;

        match self.command {
            Command::Serve(args) => serve(runtime, args).await,
            Command::Run(args) => {
                activate(&runtime, args.persona.as_deref()).await?;
                let inputs = parse_inputs(&args.inputs)?;
                runtime.shutdown().install_signal_handlers();
                let run = runtime
                    .run_skill(&args.skill, inputs, &runtime.shutdown().run_token())
                    .await
                    .with_context(|| format!("failed to run skill '{}'", args.skill))?;
                println!("{}", serde_json::to_string_pretty(&run)?);
                if !run.status.is_success() {
                    bail!("{}", run.summary());
                }
                Ok(())
            }
            Command::Tools(args) => {
                activate(&runtime, args.persona.as_deref()).await?;
                for d in runtime.registry().descriptors().await {
                    println!("{:<28} {:<10} {}", d.name, d.module, d.source);
                }
                Ok(())
            }
            Command::Personas => {
                for p in runtime.personas().list().await? {
                    println!("{:<16} [{}] {}", p.name, p.modules.join(", "), p.description);
                }
                Ok(())
            }
            Command::Jobs => {
                let scheduler = runtime.scheduler().context("invalid scheduler config")?;
                scheduler.restore().await;
                for job in scheduler.jobs().await {
                    let last = match (&job.state.last_run_at, job.state.last_status) {
                        (Some(at), Some(status)) => format!("{} at {}", status, at),
                        _ => "never run".to_string(),
                    };
                    let enabled = if job.enabled { "" } else { " (disabled)" };
                    println!("{:<20} {:<16} {}{} - {}", job.name, job.skill, job.trigger, enabled, last);
                }
                for (name, reason) in scheduler.rejected() {
                    println!("{:<20} invalid: {}", name, reason);
                }
                Ok(())
            }
        }
    }
}

async fn serve(runtime: Arc<Runtime>, args: ServeArgs) -> anyhow::Result<()> {
    if let Err(e) = activate(&runtime, args.persona.as_deref()).await {
        tracing::warn!("starting with core tools only: {:#}", e);
    }

    let shutdown = runtime.shutdown().clone();
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(runtime.config().app.shutdown_timeout_secs));

    let scheduler_task = if runtime.config().scheduler.enabled && !args.no_scheduler {
        let scheduler = Arc::new(runtime.scheduler().context("invalid scheduler config")?);
        coordinator.register(scheduler.clone());
        Some(tokio::spawn(scheduler.run(shutdown.token())))
    } else {
        None
    };

    let server = ToolServer::new(runtime.clone());
    let result = server.serve_stdio(shutdown.token()).await;
    // stdin 关闭也视为退出
    if !shutdown.is_shutdown() {
        shutdown.shutdown(ShutdownReason::ClientDisconnected);
    }
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            tracing::warn!("scheduler task ended abnormally: {}", e);
        }
    }
    coordinator.run_cleanup().await;
    if let Some(reason) = shutdown.reason() {
        tracing::info!(reason = %reason, "hive stopped");
    }
    result.context("tool server failed")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init(cli.json_logs);
    cli.run().await
}
