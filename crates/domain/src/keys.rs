use crate::models::JobIdentity;

/// Field of the id generator table holding the packet counter.
pub const ID_GENERATOR_FIELD: &str = "packet";

/// 协调存储中的表名，全部以应用名为前缀
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    app: String,
    node: String,
}

impl TableLayout {
    pub fn new(app: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            node: node.into(),
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// 本节点的进程信息表: pid -> 过期时间
    pub fn process_table(&self) -> String {
        format!("{}[{}][process]", self.app, self.node)
    }

    pub fn job_info_table(&self) -> String {
        format!("{}[job_info]", self.app)
    }

    pub fn id_generator_table(&self) -> String {
        format!("{}[id_generator]", self.app)
    }

    pub fn job_tables(&self, identity: &JobIdentity) -> JobTables {
        JobTables::new(format!("{}[{}]", self.app, identity.key()))
    }
}

/// 单个任务相关的表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTables {
    /// 任务内容 -> 任务包id
    pub ids: String,
    /// 任务包id -> 任务内容
    pub payload: String,
    /// 任务包id -> 分配记录
    pub pool: String,
    /// 任务包id -> 完成时间
    pub end_time: String,
    /// 任务包id -> 执行结果
    pub result: String,
    /// 任务包id -> 耗时
    pub cost: String,
    /// 节点:pid -> 租约结束时间，执行该任务的工作单元
    pub workers: String,
}

impl JobTables {
    fn new(prefix: String) -> Self {
        Self {
            ids: format!("{prefix}[task_ids]"),
            payload: format!("{prefix}[task_payload]"),
            pool: format!("{prefix}[task_pool]"),
            end_time: format!("{prefix}[task_endtime]"),
            result: format!("{prefix}[task_result]"),
            cost: format!("{prefix}[task_cost]"),
            workers: format!("{prefix}[task_workers]"),
        }
    }

    pub fn all(&self) -> [&str; 7] {
        [
            &self.ids,
            &self.payload,
            &self.pool,
            &self.end_time,
            &self.result,
            &self.cost,
            &self.workers,
        ]
    }
}
