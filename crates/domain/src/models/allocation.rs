use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务包分配记录：某节点上的某个子进程在租约期内独占一个任务包
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub node: String,
    pub pid: u32,
    pub apply_time: i64,
    pub lease_end: i64,
}

impl Allocation {
    pub fn new(node: impl Into<String>, pid: u32, apply_time: i64, lease_end: i64) -> Self {
        Self {
            node: node.into(),
            pid,
            apply_time,
            lease_end,
        }
    }

    /// Parses a stored allocation. Returns `None` unless all four fields are
    /// present and numeric where expected, and the lease ends after the apply
    /// time. Numeric strings are accepted, other writers may store them so.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let node = value.get("node")?.as_str()?.to_string();
        let pid = numeric(value.get("pid")?)?;
        let apply_time = numeric(value.get("apply_time")?)?;
        let lease_end = numeric(value.get("lease_end")?)?;
        if lease_end <= apply_time || pid <= 0 || pid > u32::MAX as i64 {
            return None;
        }
        Some(Self {
            node,
            pid: pid as u32,
            apply_time,
            lease_end,
        })
    }

    pub fn encode(&self) -> String {
        serde_json::json!({
            "node": self.node,
            "pid": self.pid,
            "apply_time": self.apply_time,
            "lease_end": self.lease_end,
        })
        .to_string()
    }

    pub fn within_lease(&self, now: i64) -> bool {
        now < self.lease_end
    }

    pub fn lease_duration(&self) -> i64 {
        self.lease_end - self.apply_time
    }
}

fn numeric(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 进程信息表中的一条记录（pid -> 过期时间戳）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub lease_expiry: i64,
}

impl ProcessRecord {
    pub fn new(pid: u32, lease_expiry: i64) -> Self {
        Self { pid, lease_expiry }
    }

    /// Rebuilds a record from a process table entry, `None` if malformed.
    pub fn from_entry(field: &str, value: &str) -> Option<Self> {
        let pid = field.trim().parse::<u32>().ok().filter(|pid| *pid > 0)?;
        let lease_expiry = value.trim().parse::<i64>().ok()?;
        Some(Self { pid, lease_expiry })
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.lease_expiry <= now
    }
}

/// 任务工作单元表中的一条记录（节点:pid -> 租约结束时间）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEntry {
    pub node: String,
    pub pid: u32,
    pub lease_end: i64,
}

impl WorkerEntry {
    pub fn new(node: impl Into<String>, pid: u32, lease_end: i64) -> Self {
        Self {
            node: node.into(),
            pid,
            lease_end,
        }
    }

    pub fn field(&self) -> String {
        format!("{}:{}", self.node, self.pid)
    }

    pub fn from_entry(field: &str, value: &str) -> Option<Self> {
        let (node, pid) = field.rsplit_once(':')?;
        let pid = pid.parse::<u32>().ok().filter(|pid| *pid > 0)?;
        let lease_end = value.trim().parse::<i64>().ok()?;
        Some(Self::new(node, pid, lease_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_encode_parse() {
        let alloc = Allocation::new("node-a", 4242, 1_000, 5_000);
        let parsed = Allocation::parse(&alloc.encode()).unwrap();
        assert_eq!(parsed, alloc);
        assert_eq!(parsed.lease_duration(), 4_000);
        assert!(parsed.within_lease(4_999));
        assert!(!parsed.within_lease(5_000));
    }

    #[test]
    fn test_allocation_rejects_malformed() {
        assert!(Allocation::parse("not json").is_none());
        assert!(Allocation::parse(r#"{"node":"a","pid":1,"apply_time":10}"#).is_none());
        assert!(
            Allocation::parse(r#"{"node":"a","pid":"x","apply_time":10,"lease_end":20}"#)
                .is_none()
        );
        // 租约结束时间必须晚于申请时间
        assert!(
            Allocation::parse(r#"{"node":"a","pid":1,"apply_time":20,"lease_end":20}"#)
                .is_none()
        );
    }

    #[test]
    fn test_allocation_accepts_numeric_strings() {
        let parsed =
            Allocation::parse(r#"{"node":"a","pid":"12","apply_time":"10","lease_end":20}"#)
                .unwrap();
        assert_eq!(parsed.pid, 12);
        assert_eq!(parsed.apply_time, 10);
    }

    #[test]
    fn test_process_record_from_entry() {
        let record = ProcessRecord::from_entry("321", "1700").unwrap();
        assert_eq!(record, ProcessRecord::new(321, 1700));
        assert!(record.is_expired(1700));
        assert!(!record.is_expired(1699));
        assert!(ProcessRecord::from_entry("0", "1").is_none());
        assert!(ProcessRecord::from_entry("12", "soon").is_none());
    }

    #[test]
    fn test_worker_entry_field() {
        let entry = WorkerEntry::new("node:a", 77, 1_700);
        assert_eq!(entry.field(), "node:a:77");
        assert_eq!(WorkerEntry::from_entry(&entry.field(), "1700"), Some(entry));
        assert!(WorkerEntry::from_entry("node-a", "1700").is_none());
        assert!(WorkerEntry::from_entry("node-a:0", "1700").is_none());
    }
}
