use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use ventnet_config::{AppConfig, ConfigError, StorageBackend};
use ventnet_core::EntityGraph;
use ventnet_core::entity::SceneSettings;
use ventnet_engine::command::{CommandBus, CommandContext, CommandRequest};
use ventnet_engine::{ActionService, CommandHistory};
use ventnet_io::SnapshotStore;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "ventnet", version, about = "通风网络场景编辑与快照管理")]
struct Cli {
    /// 配置文件路径，缺省时按 VENTNET_CONFIG 与 ./config/default.toml 查找
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 使用指定目录作为文件系统存储，覆盖配置
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 构建示例风网，演示撤销/重做并保存
    Demo,
    /// 列出存储中的全部场景记录
    List,
    /// 导出场景为 JSON
    Export {
        id: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 从 JSON 文件导入场景
    Import { path: PathBuf },
    /// 列出某场景的全部版本
    Versions { id: String },
    /// 载入最近的场景并依次执行文本命令
    Exec {
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_configuration(cli.config.clone());
    init_logging(&config);
    info!("启动 ventnet");

    let mut service = build_service(&config, cli.store.clone())?;
    match cli.command.unwrap_or(Command::Demo) {
        Command::Demo => cli::run_demo(&mut service)?,
        Command::List => cli::print_records(&service)?,
        Command::Export { id, output } => {
            let text = service
                .export_scene(&id)
                .with_context(|| format!("导出场景 {id} 失败"))?;
            match output {
                Some(path) => {
                    fs::write(&path, text)
                        .with_context(|| format!("写入 {} 失败", path.display()))?;
                    println!("已导出到 {}", path.display());
                }
                None => println!("{text}"),
            }
        }
        Command::Import { path } => {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("读取 {} 失败", path.display()))?;
            let id = service
                .import_scene(&text)
                .with_context(|| format!("导入 {} 失败", path.display()))?;
            println!("已导入场景 {id}，实体数 {}", service.graph().len());
        }
        Command::Versions { id } => cli::print_versions(&service, &id)?,
        Command::Exec { commands } => run_commands(&mut service, &commands)?,
    }
    Ok(())
}

fn build_service(config: &AppConfig, store_override: Option<PathBuf>) -> Result<ActionService> {
    let store = match (store_override, config.storage.backend) {
        (Some(root), _) => SnapshotStore::open(&root)
            .with_context(|| format!("打开存储目录 {} 失败", root.display()))?,
        (None, StorageBackend::Filesystem) => SnapshotStore::open(&config.storage.root)
            .with_context(|| format!("打开存储目录 {} 失败", config.storage.root.display()))?,
        (None, StorageBackend::Memory) => SnapshotStore::in_memory(),
    }
    .with_precision(config.scene.decimals);

    let mut graph = EntityGraph::with_precision(config.scene.decimals);
    if let Err(err) = graph.set_settings(SceneSettings {
        scale: config.scene.scale,
        ..SceneSettings::default()
    }) {
        warn!(scale = config.scene.scale, error = %err, "配置中的场景比例无效，使用默认值");
    }

    Ok(ActionService::new(
        graph,
        CommandHistory::new(config.history.max_size),
        store,
    )
    .with_default_name(config.scene.default_name.clone()))
}

fn run_commands(service: &mut ActionService, lines: &[String]) -> Result<()> {
    if let Some(id) = service.load_latest()? {
        println!("已载入场景 {id}");
    }
    let bus = CommandBus::new();
    let mut failures = 0usize;
    for line in lines {
        let Some(request) = CommandRequest::parse(line) else {
            continue;
        };
        let mut context = CommandContext {
            service: &mut *service,
        };
        let response = bus.dispatch(&request, &mut context);
        let message = response.message.unwrap_or_default();
        if response.success {
            println!("{message}");
        } else {
            failures += 1;
            eprintln!("{message}");
        }
    }
    if failures > 0 {
        bail!("{failures} 条命令执行失败");
    }
    Ok(())
}

/// 配置加载失败时退回内建默认值，不阻止启动。
fn load_configuration(override_path: Option<PathBuf>) -> AppConfig {
    let loaded = match override_path {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::discover(),
    };
    loaded.unwrap_or_else(|err| {
        match &err {
            ConfigError::Io { path, .. } | ConfigError::Parse { path, .. } => {
                warn!(path = %path.display(), error = %err, "加载配置失败，使用内建默认值");
            }
            ConfigError::Context { .. } => {
                warn!(error = %err, "加载配置失败，使用内建默认值");
            }
        }
        AppConfig::default()
    })
}

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_new(config.logging.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if subscriber.try_init().is_err() {
        // 已初始化，忽略
    }
}
