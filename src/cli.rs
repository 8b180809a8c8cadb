use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use packet_core::{LogFormat, LoggingConfig};
use packet_domain::{
    CallMode, ExecuteOptions, JobIdentity, SortMode, Task, WorkerSpec, DEFAULT_NAMESPACE,
};

use crate::app::{load_tasks, RunRequest};

pub fn command() -> Command {
    Command::new("packet-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("多进程任务包调度系统")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("配置文件路径"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("日志级别，覆盖配置文件"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .value_parser(["json", "pretty", "compact"])
                .help("日志格式，覆盖配置文件"),
        )
        .subcommand(
            Command::new("run")
                .about("分派一组任务")
                .arg(handler_arg())
                .arg(namespace_arg())
                .arg(
                    Arg::new("tasks")
                        .short('t')
                        .long("tasks")
                        .value_name("FILE")
                        .help("任务列表文件(JSON数组)，- 表示标准输入")
                        .conflicts_with("task"),
                )
                .arg(
                    Arg::new("task")
                        .long("task")
                        .value_name("JSON")
                        .action(ArgAction::Append)
                        .help("单个任务，可重复"),
                )
                .arg(
                    Arg::new("workers")
                        .short('w')
                        .long("workers")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .help("启动的工作单元数"),
                )
                .arg(
                    Arg::new("max-fork")
                        .long("max-fork")
                        .value_name("N")
                        .value_parser(clap::value_parser!(usize))
                        .help("本次最多启动的工作单元数"),
                )
                .arg(
                    Arg::new("mode")
                        .short('m')
                        .long("mode")
                        .value_parser(["async", "sync"])
                        .default_value("async")
                        .help("调用方式"),
                )
                .arg(
                    Arg::new("lease")
                        .long("lease")
                        .value_name("SECONDS")
                        .value_parser(clap::value_parser!(u64))
                        .help("租约时长(秒)"),
                )
                .arg(
                    Arg::new("sort")
                        .long("sort")
                        .value_parser(["normal", "asc_before", "asc_after", "desc_before", "desc_after"])
                        .default_value("normal")
                        .help("按历史耗时排序"),
                )
                .arg(
                    Arg::new("wait")
                        .long("wait")
                        .action(ArgAction::SetTrue)
                        .help("异步模式下等待任务结束后再输出"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("查询任务状态")
                .arg(handler_arg())
                .arg(namespace_arg()),
        )
        .subcommand(Command::new("processes").about("查看本节点的进程数"))
        .subcommand(
            Command::new("worker")
                .about("以工作单元身份运行(由调度器启动)")
                .hide(true)
                .arg(handler_arg())
                .arg(namespace_arg())
                .arg(
                    Arg::new("lease-end")
                        .long("lease-end")
                        .value_name("MILLIS")
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
}

fn handler_arg() -> Arg {
    Arg::new("handler")
        .long("handler")
        .value_name("NAME")
        .required(true)
        .help("回调名")
}

fn namespace_arg() -> Arg {
    Arg::new("namespace")
        .short('n')
        .long("namespace")
        .value_name("NS")
        .default_value(DEFAULT_NAMESPACE)
        .help("命名空间")
}

pub fn config_path(matches: &ArgMatches) -> Option<PathBuf> {
    matches.get_one::<String>("config").map(PathBuf::from)
}

/// 命令行参数覆盖配置中的日志设置
pub fn apply_logging_overrides(matches: &ArgMatches, logging: &mut LoggingConfig) -> Result<()> {
    if let Some(level) = matches.get_one::<String>("log-level") {
        logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        logging.format = format.parse::<LogFormat>().map_err(anyhow::Error::msg)?;
    }
    Ok(())
}

pub fn identity(matches: &ArgMatches) -> Result<JobIdentity> {
    let handler = matches.get_one::<String>("handler").cloned().unwrap_or_default();
    let namespace = matches
        .get_one::<String>("namespace")
        .cloned()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    Ok(JobIdentity::new(namespace, handler)?)
}

pub fn worker_spec(matches: &ArgMatches) -> Result<WorkerSpec> {
    let lease_end_ms = matches
        .get_one::<i64>("lease-end")
        .copied()
        .context("缺少 --lease-end")?;
    Ok(WorkerSpec {
        identity: identity(matches)?,
        lease_end_ms,
    })
}

/// 解析 `run` 子命令；未指定的参数取 `defaults`
pub fn run_request(matches: &ArgMatches, defaults: ExecuteOptions) -> Result<RunRequest> {
    let identity = identity(matches)?;

    let tasks: Vec<Task> = if let Some(path) = matches.get_one::<String>("tasks") {
        load_tasks(&PathBuf::from(path))?
    } else {
        matches
            .get_many::<String>("task")
            .unwrap_or_default()
            // 不是JSON的当作字符串任务
            .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Task::String(raw.clone())))
            .collect()
    };

    let mut options = ExecuteOptions {
        namespace: identity.namespace.clone(),
        ..defaults
    };
    if let Some(workers) = matches.get_one::<usize>("workers") {
        options.worker_count = *workers;
    }
    options.max_fork = matches.get_one::<usize>("max-fork").copied();
    if let Some(mode) = matches.get_one::<String>("mode") {
        options.call_mode = mode.parse::<CallMode>()?;
    }
    if let Some(lease) = matches.get_one::<u64>("lease") {
        options.lease = Duration::from_secs(*lease);
    }
    if let Some(sort) = matches.get_one::<String>("sort") {
        options.sort_mode = sort.parse::<SortMode>()?;
    }

    Ok(RunRequest {
        handler: identity.handler,
        tasks,
        options,
        wait: matches.get_flag("wait"),
    })
}
