use std::collections::HashMap;

use packet_core::SchedulerResult;
use packet_domain::{PacketId, PacketRef, SortMode};

use crate::ledger::AllocationLedger;

/// 按历史耗时对待执行任务包排序，没有耗时记录的任务包保持原顺序
pub fn sort_packets(
    packets: &[PacketRef],
    costs: &HashMap<PacketId, i64>,
    mode: SortMode,
) -> Vec<PacketRef> {
    if mode == SortMode::Normal || costs.is_empty() {
        return packets.to_vec();
    }

    let (mut costed, new): (Vec<PacketRef>, Vec<PacketRef>) =
        packets.iter().partition(|p| costs.contains_key(&p.id));

    let cost_of = |p: &PacketRef| costs.get(&p.id).copied().unwrap_or_default();
    if mode.is_ascending() {
        costed.sort_by_key(cost_of);
    } else {
        costed.sort_by(|a, b| cost_of(b).cmp(&cost_of(a)));
    }

    if mode.new_first() {
        new.into_iter().chain(costed).collect()
    } else {
        costed.into_iter().chain(new).collect()
    }
}

pub struct PacketSorter<'a> {
    ledger: &'a AllocationLedger,
}

impl<'a> PacketSorter<'a> {
    pub fn new(ledger: &'a AllocationLedger) -> Self {
        Self { ledger }
    }

    pub async fn sort(&self, packets: &[PacketRef], mode: SortMode) -> SchedulerResult<Vec<PacketRef>> {
        if mode == SortMode::Normal || packets.is_empty() {
            return Ok(packets.to_vec());
        }
        let ids: Vec<PacketId> = packets.iter().map(|p| p.id).collect();
        let costs = self.ledger.costs(&ids).await?;
        Ok(sort_packets(packets, &costs, mode))
    }
}
