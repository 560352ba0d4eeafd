//! Routing table derived from desired routes and running instances.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::{ActualLrp, ActualLrpState, DesiredLrp};

/// `hostname → [address:port]`, both sides sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RoutingTable(pub BTreeMap<String, Vec<String>>);

impl RoutingTable {
    pub fn endpoints(&self, hostname: &str) -> &[String] {
        self.0.get(hostname).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn routing_table(desired: &[DesiredLrp], actuals: &[ActualLrp]) -> RoutingTable {
    let by_guid: HashMap<&str, &DesiredLrp> = desired
        .iter()
        .map(|d| (d.process_guid.as_str(), d))
        .collect();

    let mut table: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for actual in actuals {
        if actual.state != ActualLrpState::Running {
            continue;
        }
        let (Some(desired), Some(net_info)) =
            (by_guid.get(actual.process_guid.as_str()), &actual.net_info)
        else {
            continue;
        };
        if actual.index >= desired.instances {
            continue;
        }
        for route in &desired.routes {
            let Some(mapping) = net_info
                .ports
                .iter()
                .find(|p| p.container_port == route.port)
            else {
                continue;
            };
            let endpoint = format!("{}:{}", net_info.address, mapping.host_port);
            for hostname in &route.hostnames {
                table.entry(hostname.clone()).or_default().push(endpoint.clone());
            }
        }
    }
    for endpoints in table.values_mut() {
        endpoints.sort();
        endpoints.dedup();
    }
    RoutingTable(table)
}

impl StateStore {
    pub fn routing_table(&self) -> StateResult<RoutingTable> {
        Ok(routing_table(&self.desired_lrps()?, &self.actual_lrps()?))
    }
}
