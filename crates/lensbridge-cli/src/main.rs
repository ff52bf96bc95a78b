//! Lensbridge CLI
//!
//! 配对左右镜片并发送文本或位图

mod output;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use lensbridge_core::{
    AppSettings, BtleTransport, DEFAULT_EVENT_CAPACITY, EventSink, Glasses, GlassesError,
    MemoryTransport, Side, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const PRINTER_DRAIN: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "lensbridge", version, about = "双镜片智能眼镜 BLE 通信工具")]
struct Cli {
    /// 配置文件路径 (默认: ~/.config/lensbridge/settings.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 使用内存传输演练，不访问蓝牙
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Link(LinkCommand),
    /// 打印当前生效的配置
    Config {
        /// 同时写入默认配置文件
        #[arg(long)]
        write: bool,
    },
}

/// 需要先配对眼镜的命令
#[derive(Subcommand)]
enum LinkCommand {
    /// 发送文本
    Text {
        message: String,
        #[arg(short, long, value_enum, default_value = "both")]
        side: SideArg,
    },
    /// 发送位图文件
    Bitmap {
        file: PathBuf,
        #[arg(short, long, value_enum, default_value = "both")]
        side: SideArg,
    },
    /// 交互模式：每行发送到两侧
    Repl,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Left,
    Right,
    Both,
}

impl SideArg {
    /// `None` 表示两侧
    fn single(self) -> Option<Side> {
        match self {
            SideArg::Left => Some(Side::Left),
            SideArg::Right => Some(Side::Right),
            SideArg::Both => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（lensbridge-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lensbridge_core=debug")),
        )
        .try_init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => AppSettings::load_from(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => AppSettings::load(),
    };

    let command = match cli.command {
        Commands::Link(command) => command,
        Commands::Config { write } => {
            print!("{}", settings.to_toml()?);
            if write {
                settings.save()?;
                println!("# saved to {}", AppSettings::config_path().display());
            }
            return Ok(());
        }
    };

    if cli.dry_run {
        tracing::info!("Dry run: using in-memory transport");
        run(Arc::new(MemoryTransport::with_glasses()), &settings, command).await
    } else {
        let transport = BtleTransport::new(&settings.discovery_filter()).await?;
        run(Arc::new(transport), &settings, command).await
    }
}

async fn run<T: Transport>(
    transport: Arc<T>,
    settings: &AppSettings,
    command: LinkCommand,
) -> Result<()> {
    let (events, rx) = EventSink::channel(DEFAULT_EVENT_CAPACITY);
    let printer = output::spawn_printer(rx);

    let glasses = Glasses::new(transport, settings, events)?;
    let result = execute(&glasses, command).await;
    glasses.disconnect_all().await;

    // 给打印任务一点时间输出剩余消息
    drop(glasses);
    let _ = tokio::time::timeout(PRINTER_DRAIN, printer).await;
    result
}

async fn execute<T: Transport>(glasses: &Glasses<T>, command: LinkCommand) -> Result<()> {
    glasses.pair_all().await?;

    match command {
        LinkCommand::Text { message, side } => check(match side.single() {
            Some(side) => vec![(side, glasses.send_text(side, &message).await)],
            None => glasses.send_text_all(&message).await,
        }),
        LinkCommand::Bitmap { file, side } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            check(match side.single() {
                Some(side) => vec![(side, glasses.send_bitmap(side, &bytes).await)],
                None => glasses.send_bitmap_all(&bytes).await,
            })
        }
        LinkCommand::Repl => repl(glasses).await,
    }
}

fn check(results: Vec<(Side, Result<(), GlassesError>)>) -> Result<()> {
    let failed: Vec<String> = results
        .into_iter()
        .filter_map(|(side, r)| r.err().map(|e| format!("{side}: {e}")))
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        bail!("Send failed ({})", failed.join("; "))
    }
}

async fn repl<T: Transport>(glasses: &Glasses<T>) -> Result<()> {
    println!("Type a message and press Enter, :quit to exit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line == ":quit" {
            break;
        }
        if line.is_empty() {
            println!("❌ Please enter a message");
            continue;
        }

        for (side, result) in glasses.send_text_all(line).await {
            if let Err(e) = result {
                tracing::warn!("[{}] {}", side, e);
            }
        }
    }
    Ok(())
}
