//! Record builders for converger tests.

use std::collections::BTreeMap;

use cellgrid_state::{
    Action, ActualLrp, ActualLrpState, CellCapacity, CellPresence, DesiredLrp, Resources, Task,
    TaskState,
};

pub fn desired(guid: &str, instances: u32) -> DesiredLrp {
    DesiredLrp {
        process_guid: guid.to_string(),
        domain: "apps".to_string(),
        instances,
        rootfs: "preloaded:cflinuxfs".to_string(),
        setup: None,
        action: Action::run("sleep", &["1000"]),
        monitor: None,
        start_timeout_ms: 0,
        resources: Resources {
            memory_mb: 64,
            disk_mb: 64,
            max_pids: 0,
        },
        privileged: false,
        volume_mounts: vec![],
        egress_rules: vec![],
        ports: vec![8080],
        routes: vec![],
        cached_dependencies: vec![],
        properties: BTreeMap::new(),
        annotation: String::new(),
        created_at: 0,
        updated_at: 0,
        modification_index: 0,
    }
}

pub fn actual(guid: &str, index: u32, state: ActualLrpState, cell_id: &str, since: u64) -> ActualLrp {
    let owned = !cell_id.is_empty();
    ActualLrp {
        process_guid: guid.to_string(),
        index,
        domain: "apps".to_string(),
        instance_guid: if owned { format!("ig-{index}") } else { String::new() },
        cell_id: cell_id.to_string(),
        state,
        crash_count: 0,
        crash_reason: None,
        placement_error: None,
        net_info: None,
        since,
        modification_index: 1,
    }
}

pub fn cell(cell_id: &str, expires_at: u64) -> CellPresence {
    CellPresence {
        cell_id: cell_id.to_string(),
        zone: "z1".to_string(),
        rep_address: String::new(),
        capacity: CellCapacity::default(),
        stacks: vec![],
        providers: vec![],
        volume_drivers: vec![],
        allows_privileged: false,
        expires_at,
        modification_index: 0,
    }
}

pub fn task(guid: &str, state: TaskState, at: u64) -> Task {
    Task {
        task_guid: guid.to_string(),
        domain: "tasks".to_string(),
        rootfs: "preloaded:cflinuxfs".to_string(),
        action: Action::run("true", &[]),
        resources: Resources::default(),
        volume_mounts: vec![],
        egress_rules: vec![],
        privileged: false,
        result_file: None,
        properties: BTreeMap::new(),
        cached_dependencies: vec![],
        annotation: String::new(),
        state,
        cell_id: String::new(),
        failed: false,
        failure_reason: String::new(),
        result: String::new(),
        created_at: at,
        updated_at: at,
        first_completed_at: None,
        modification_index: 0,
    }
}
